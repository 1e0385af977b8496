mod anomaly;
pub mod backup;
mod catalog;
pub mod clock;
mod collections;
pub mod evaluator;
mod ingest;
mod lifecycle;
pub mod policy;
mod recommendation;
mod registry;
mod tables;
pub mod types;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
pub use rocksdb::backup::BackupEngineInfo;
use thiserror::Error;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::evaluator::{Detection, ThresholdCatalog};
pub use self::policy::EngineConfig;
pub use self::registry::EquipmentHistory;
use self::tables::StateDb;
pub use self::tables::{
    AnomalyLog, Equipment, EquipmentUpdate, IndexedTable, Iterable, Measurement, Recommendation,
    RecommendationTable, SensorReading, Table, Threshold, ThresholdUpdate, Ticket, TicketTable,
    UniqueKey,
};
pub use self::types::{
    AnomalyId, AnomalyKind, Direction, EquipmentId, EquipmentStatus, Parameter, ReadingId,
    RecommendationId, Severity, TicketId, TicketStatus,
};

const DEFAULT_STATES: &str = "states.db";
const EXCLUSIVE: bool = true;

/// The equipment-health store.
pub struct Store {
    states: StateDb,
    config: EngineConfig,
}

impl Store {
    /// Opens a new store and its backup with the default engine
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or its backup cannot be opened.
    pub fn new(path: &Path, backup: &Path) -> Result<Self> {
        Self::with_config(path, backup, EngineConfig::default())
    }

    /// Opens a new store and its backup.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or its backup cannot be opened.
    pub fn with_config(path: &Path, backup: &Path, config: EngineConfig) -> Result<Self> {
        Self::open(path, backup, config, false)
    }

    /// Opens a store, restoring it from the latest usable backup if the
    /// database cannot be opened.
    ///
    /// # Errors
    ///
    /// Returns an error if neither the store nor any backup can be opened.
    pub fn open_or_recover(path: &Path, backup: &Path, config: EngineConfig) -> Result<Self> {
        Self::open(path, backup, config, true)
    }

    fn open(path: &Path, backup: &Path, config: EngineConfig, recover: bool) -> Result<Self> {
        let db_path = path.join(DEFAULT_STATES);
        let backup_path = backup.join(DEFAULT_STATES);
        let states = StateDb::open(&db_path, backup_path, recover)?;
        tracing::info!("store opened at {}", db_path.display());
        Ok(Self { states, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn anomaly_log_map(&self) -> Table<'_, AnomalyLog> {
        self.states.anomaly_logs()
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn equipment_map(&self) -> Table<'_, Equipment> {
        self.states.equipments()
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn recommendation_map(&self) -> RecommendationTable<'_> {
        self.states.recommendations()
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn sensor_data_map(&self) -> Table<'_, SensorReading> {
        self.states.sensor_data()
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn threshold_map(&self) -> IndexedTable<'_, Threshold> {
        self.states.thresholds()
    }

    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn ticket_map(&self) -> TicketTable<'_> {
        self.states.tickets()
    }

    /// Backup current database and keep most recent `num_backups_to_keep` backups
    ///
    /// # Errors
    ///
    /// Returns an error when backup engine fails.
    pub(crate) fn backup(&mut self, flush: bool, num_of_backups_to_keep: u32) -> Result<()> {
        self.states
            .create_new_backup_flush(flush, num_of_backups_to_keep)
    }

    /// Get the backup information for backups on file.
    ///
    /// # Errors
    ///
    /// Returns an error when backup engine fails.
    pub fn get_backup_info(&self) -> Result<Vec<BackupEngineInfo>> {
        self.states.get_backup_info()
    }

    /// Restore from the backup with `backup_id` on file
    ///
    /// # Errors
    ///
    /// Returns an error when backup engine fails or restoration fails.
    pub fn restore_from_backup(&mut self, backup_id: u32) -> Result<()> {
        self.states.restore_from_backup(backup_id)
    }

    /// Restore from the latest backup on file
    ///
    /// # Errors
    ///
    /// Returns an error when backup engine fails or restoration fails.
    pub fn restore_from_latest_backup(&mut self) -> Result<()> {
        self.states.restore_from_latest_backup()
    }

    /// Purge old backups and only keep `num_backups_to_keep` backups on file
    ///
    /// # Errors
    ///
    /// Returns an error when backup engine fails.
    pub fn purge_old_backups(&mut self, num_backups_to_keep: u32) -> Result<()> {
        self.states.purge_old_backups(num_backups_to_keep)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("reading at {time} is older than the latest stored reading at {latest}")]
    OutOfOrder {
        time: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error("ticket cannot move from {from} to {to}")]
    InvalidTransition { from: TicketStatus, to: TicketStatus },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}
