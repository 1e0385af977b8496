//! The `anomaly_logs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

use super::{Table, UniqueKey, Value};
use crate::{
    collections::Map,
    types::{AnomalyId, AnomalyKind, EquipmentId, FromKeyValue, ReadingId, Severity},
    Iterable,
};

/// A detected out-of-bounds condition or reported failure. Entries are never
/// changed after they are recorded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnomalyLog {
    pub id: AnomalyId,
    pub equipment_id: EquipmentId,
    pub reading_id: ReadingId,
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// How far the value went into the warning band, in `[0, 1]`.
    pub confidence: f64,
    /// The observed value, if the anomaly is about a numeric parameter.
    pub value: Option<f64>,
    pub reading_time: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl AnomalyLog {
    pub(crate) fn key(equipment_id: EquipmentId, id: AnomalyId) -> [u8; 8] {
        let mut key = [0; 8];
        key[..4].copy_from_slice(&equipment_id.to_be_bytes());
        key[4..].copy_from_slice(&id.to_be_bytes());
        key
    }
}

impl FromKeyValue for AnomalyLog {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl UniqueKey for AnomalyLog {
    fn unique_key(&self) -> Vec<u8> {
        Self::key(self.equipment_id, self.id).to_vec()
    }
}

impl Value for AnomalyLog {
    fn value(&self) -> Vec<u8> {
        super::serialize(self).expect("serializable")
    }
}

/// Functions for the `anomaly_logs` map.
impl<'d> Table<'d, AnomalyLog> {
    /// Opens the `anomaly_logs` table in the database.
    ///
    /// Returns `None` if the table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        Map::open(db, super::ANOMALY_LOGS).map(Table::new)
    }

    /// Returns the anomaly with the given ID recorded for an equipment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get(&self, equipment_id: EquipmentId, id: AnomalyId) -> Result<Option<AnomalyLog>> {
        self.get_record(&AnomalyLog::key(equipment_id, id))
    }

    /// Returns the anomalies of an equipment in the order they were recorded.
    ///
    /// With `since`, only anomalies from readings taken at or after that time
    /// are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn list_by_equipment(
        &self,
        equipment_id: EquipmentId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Vec<AnomalyLog>> {
        let mut anomalies = Vec::new();
        for entry in self.prefix_iter(Direction::Forward, None, &equipment_id.to_be_bytes()) {
            let anomaly = entry?;
            if since.is_none_or(|since| anomaly.reading_time >= *since) {
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }

    /// Deletes every anomaly of an equipment in `txn`.
    pub(crate) fn delete_by_equipment(
        &self,
        equipment_id: EquipmentId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<usize> {
        self.map
            .delete_prefix_with_transaction(&equipment_id.to_be_bytes(), txn)
            .context("cannot delete anomalies")
    }
}
