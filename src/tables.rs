mod anomaly_log;
mod equipment;
mod recommendation;
mod sensor_data;
mod threshold;
mod ticket;

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

pub use self::anomaly_log::AnomalyLog;
pub use self::equipment::{Equipment, Update as EquipmentUpdate};
pub use self::recommendation::{Recommendation, Table as RecommendationTable};
pub use self::sensor_data::{Measurement, SensorReading};
pub use self::threshold::{Threshold, Update as ThresholdUpdate};
pub use self::ticket::{Table as TicketTable, Ticket};
use crate::{
    collections::{IndexedMap, Map, MapIterator},
    types::FromKeyValue,
};

// Key-value map names in `Database`.
pub(super) const ANOMALY_LOGS: &str = "anomaly_logs";
pub(super) const EQUIPMENTS: &str = "equipments";
pub(super) const MAINTENANCE_RECOMMENDATIONS: &str = "maintenance_recommendations";
pub(super) const MAINTENANCE_TICKETS: &str = "maintenance_tickets";
pub(super) const MAINTENANCE_TICKET_IDS: &str = "maintenance_ticket_ids";
const META: &str = "meta";
pub(super) const RECOMMENDATION_ANOMALIES: &str = "recommendation_anomalies";
pub(super) const SENSOR_DATA: &str = "sensor_data";
pub(super) const THRESHOLDS: &str = "thresholds";

const MAP_NAMES: [&str; 9] = [
    ANOMALY_LOGS,
    EQUIPMENTS,
    MAINTENANCE_RECOMMENDATIONS,
    MAINTENANCE_TICKETS,
    MAINTENANCE_TICKET_IDS,
    META,
    RECOMMENDATION_ANOMALIES,
    SENSOR_DATA,
    THRESHOLDS,
];

// Keys for the meta map.
pub(super) const ANOMALY_SEQUENCE: &[u8] = b"anomaly id";
pub(super) const EQUIPMENT_SEQUENCE: &[u8] = b"equipment id";
pub(super) const READING_SEQUENCE: &[u8] = b"reading id";
pub(super) const RECOMMENDATION_SEQUENCE: &[u8] = b"recommendation id";
pub(super) const TICKET_SEQUENCE: &[u8] = b"ticket id";

#[allow(clippy::module_name_repetitions)]
pub(crate) struct StateDb {
    inner: Option<OptimisticTransactionDB>,
    backup: PathBuf,
    db: PathBuf,
}

impl StateDb {
    pub fn open(path: &Path, backup: PathBuf, recover_on_fail: bool) -> Result<Self> {
        let db = match Self::open_db(path) {
            Ok(db) => db,
            Err(e) => {
                if recover_on_fail {
                    tracing::warn!("fail to open db {e:?}");
                    tracing::warn!("recovering from latest backup available");

                    Self::recover_db(path, &backup)?
                } else {
                    return Err(e);
                }
            }
        };

        Ok(Self {
            inner: Some(db),
            backup,
            db: path.to_owned(),
        })
    }

    pub(crate) fn db(&self) -> &OptimisticTransactionDB {
        self.inner.as_ref().expect("database must be open")
    }

    #[must_use]
    pub(crate) fn anomaly_logs(&self) -> Table<'_, AnomalyLog> {
        Table::<AnomalyLog>::open(self.db()).expect("anomaly log table must be present")
    }

    #[must_use]
    pub(crate) fn equipments(&self) -> Table<'_, Equipment> {
        Table::<Equipment>::open(self.db()).expect("equipment table must be present")
    }

    #[must_use]
    pub(crate) fn recommendations(&self) -> RecommendationTable<'_> {
        RecommendationTable::open(self.db()).expect("recommendation tables must be present")
    }

    #[must_use]
    pub(crate) fn sensor_data(&self) -> Table<'_, SensorReading> {
        Table::<SensorReading>::open(self.db()).expect("sensor data table must be present")
    }

    #[must_use]
    pub(crate) fn thresholds(&self) -> IndexedTable<'_, Threshold> {
        IndexedTable::<Threshold>::open(self.db()).expect("threshold table must be present")
    }

    #[must_use]
    pub(crate) fn tickets(&self) -> TicketTable<'_> {
        TicketTable::open(self.db()).expect("ticket tables must be present")
    }

    #[must_use]
    pub(crate) fn sequence(&self, name: &'static [u8]) -> Sequence<'_> {
        let map = Map::open(self.db(), META).expect("meta map must be present");
        Sequence { map, name }
    }

    pub(super) fn create_new_backup_flush(
        &mut self,
        flush: bool,
        num_of_backups_to_keep: u32,
    ) -> Result<()> {
        let mut engine = Self::open_backup_engine(self.backup.as_path())?;

        let inner = self
            .inner
            .as_ref()
            .ok_or(anyhow!("unable to backup, database has closed"))?;
        engine.create_new_backup_flush(inner, flush)?;

        engine
            .purge_old_backups(num_of_backups_to_keep as usize)
            .or_else(|_| self.reboot())
    }

    pub fn restore_from_latest_backup(&mut self) -> Result<()> {
        let mut engine = Self::open_backup_engine(self.backup.as_path())?;

        let mut opts = rocksdb::backup::RestoreOptions::default();
        opts.set_keep_log_files(true);

        self.close();

        engine.restore_from_latest_backup(&self.db, &self.db, &opts)?;

        self.reboot()
    }

    pub fn restore_from_backup(&mut self, id: u32) -> Result<()> {
        let mut engine = Self::open_backup_engine(self.backup.as_path())?;

        let opts = rocksdb::backup::RestoreOptions::default();

        self.close();

        engine.restore_from_backup(&self.db, &self.db, &opts, id)?;

        self.reboot()
    }

    pub fn get_backup_info(&self) -> Result<Vec<rocksdb::backup::BackupEngineInfo>> {
        let engine = Self::open_backup_engine(self.backup.as_path())?;

        Ok(engine.get_backup_info())
    }

    pub fn purge_old_backups(&mut self, num_of_backups_to_keep: u32) -> Result<()> {
        let mut engine = Self::open_backup_engine(self.backup.as_path())?;

        if engine
            .purge_old_backups(num_of_backups_to_keep as usize)
            .is_err()
        {
            self.reboot()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(db) = self.inner.as_ref() {
            db.cancel_all_background_work(true);
        }
        self.inner = None;
    }

    fn reboot(&mut self) -> Result<()> {
        self.inner = Some(Self::open_db(&self.db)?);
        Ok(())
    }

    fn open_db(path: &Path) -> Result<OptimisticTransactionDB> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        Ok(OptimisticTransactionDB::open_cf(&opts, path, MAP_NAMES)?)
    }

    fn recover_db(path: &Path, backup: &Path) -> Result<OptimisticTransactionDB> {
        let mut engine = Self::open_backup_engine(backup)?;
        let available = engine.get_backup_info();
        let restore_opts = rocksdb::backup::RestoreOptions::default();
        for backup_id in available.into_iter().rev().map(|b| b.backup_id) {
            match engine.restore_from_backup(path, path, &restore_opts, backup_id) {
                Ok(()) => match Self::open_db(path) {
                    Ok(db) => {
                        tracing::info!("restored from backup (id: {backup_id})");
                        return Ok(db);
                    }
                    Err(e) => {
                        tracing::warn!("opening restored backup (id: {backup_id}) failed {e:?}");
                    }
                },
                Err(e) => {
                    tracing::error!("restoring backup (id: {backup_id}) failed {e:?}");
                }
            }
        }
        Err(anyhow!(
            "unable to recover from backups available at: {}",
            backup.display()
        ))
    }

    fn open_backup_engine(path: &Path) -> Result<rocksdb::backup::BackupEngine> {
        let opts = rocksdb::backup::BackupEngineOptions::new(path)?;
        let db_env = rocksdb::Env::new()?;
        Ok(rocksdb::backup::BackupEngine::open(&opts, &db_env)?)
    }
}

/// A monotonically increasing ID sequence stored in the meta map.
///
/// IDs start at 1. They are taken in the transaction that writes the record,
/// so a rolled-back write returns its ID and IDs follow commit order.
pub(crate) struct Sequence<'d> {
    map: Map<'d>,
    name: &'static [u8],
}

impl Sequence<'_> {
    pub(crate) fn next(&self, txn: &Transaction<'_, OptimisticTransactionDB>) -> Result<u32> {
        let current = match self.map.get_for_update(self.name, txn)? {
            Some(value) => u32::from_be_bytes(
                value
                    .as_slice()
                    .try_into()
                    .context("invalid sequence value")?,
            ),
            None => 0,
        };
        let next = current.checked_add(1).context("sequence exhausted")?;
        self.map
            .put_with_transaction(self.name, &next.to_be_bytes(), txn)?;
        Ok(next)
    }
}

pub trait UniqueKey {
    /// Returns the key under which the record is stored.
    fn unique_key(&self) -> Vec<u8>;
}

pub trait Value {
    fn value(&self) -> Vec<u8>;
}

pub trait Iterable<'i, I> {
    fn iter(&'i self, direction: Direction, from: Option<&[u8]>) -> I;
    fn prefix_iter(&'i self, direction: Direction, from: Option<&[u8]>, prefix: &[u8]) -> I;
}

/// A database table storing records of type `R`.
pub struct Table<'d, R> {
    map: Map<'d>,
    _phantom: PhantomData<R>,
}

impl<'d, R> Table<'d, R> {
    fn new(map: Map<'d>) -> Self {
        Self {
            map,
            _phantom: PhantomData,
        }
    }
}

impl<'d, R> Table<'d, R>
where
    R: UniqueKey + Value,
{
    /// Stores a record in `txn`, overwriting any record with the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub(crate) fn put_with_transaction(
        &self,
        record: &R,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        self.map
            .put_with_transaction(&record.unique_key(), &record.value(), txn)
    }

    /// Stores a new record in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same key exists or the database
    /// operation fails.
    pub(crate) fn insert_with_transaction(
        &self,
        record: &R,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        self.map
            .insert_with_transaction(&record.unique_key(), &record.value(), txn)
    }

    /// Deletes a record in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub(crate) fn delete_with_transaction(
        &self,
        record: &R,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        self.map.delete_with_transaction(&record.unique_key(), txn)
    }
}

impl<'d, R: FromKeyValue> Table<'d, R> {
    fn get_record(&self, key: &[u8]) -> Result<Option<R>> {
        self.map
            .get(key)?
            .map(|value| R::from_key_value(key, &value))
            .transpose()
    }

    fn get_record_for_update(
        &self,
        key: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<Option<R>> {
        self.map
            .get_for_update(key, txn)?
            .map(|value| R::from_key_value(key, &value))
            .transpose()
    }
}

impl<'i, 'd, R> Iterable<'i, TableIter<'d, R>> for Table<'d, R>
where
    R: FromKeyValue,
{
    fn iter(&'i self, direction: Direction, from: Option<&[u8]>) -> TableIter<'d, R> {
        let mode = match (from, direction) {
            (Some(from), direction) => IteratorMode::From(from, direction),
            (None, Direction::Forward) => IteratorMode::Start,
            (None, Direction::Reverse) => IteratorMode::End,
        };
        TableIter::new(self.map.inner_iterator(mode))
    }

    fn prefix_iter(
        &'i self,
        direction: Direction,
        from: Option<&[u8]>,
        prefix: &[u8],
    ) -> TableIter<'d, R> {
        TableIter::new(self.map.inner_prefix_iterator(direction, from, prefix))
    }
}

/// A database table storing records of type `R` with numerical IDs.
pub struct IndexedTable<'d, R> {
    indexed_map: IndexedMap<'d>,
    _phantom: PhantomData<R>,
}

impl<'d, R> IndexedTable<'d, R> {
    fn new(indexed_map: IndexedMap<'d>) -> Self {
        Self {
            indexed_map,
            _phantom: PhantomData,
        }
    }
}

/// An iterator over the records in a table.
pub struct TableIter<'i, R> {
    inner: MapIterator<'i>,
    _phantom: PhantomData<R>,
}

impl<'i, R> TableIter<'i, R> {
    fn new(inner: MapIterator<'i>) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }
}

impl<R: FromKeyValue> Iterator for TableIter<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| {
            let (key, value) = item?;
            R::from_key_value(&key, &value)
        })
    }
}

/// Encodes a timestamp so that byte order matches time order.
pub(crate) fn time_key(time: &DateTime<Utc>) -> Result<[u8; 8]> {
    let nanos = time
        .timestamp_nanos_opt()
        .ok_or_else(|| anyhow!("timestamp out of range: {time}"))?;
    Ok((u64::from_be_bytes(nanos.to_be_bytes()) ^ (1 << 63)).to_be_bytes())
}

fn serialize<I: Serialize>(input: &I) -> Result<Vec<u8>> {
    use bincode::Options;
    Ok(bincode::DefaultOptions::new().serialize(input)?)
}

fn deserialize<'de, O: Deserialize<'de>>(input: &'de [u8]) -> Result<O> {
    use bincode::Options;
    Ok(bincode::DefaultOptions::new().deserialize(input)?)
}
