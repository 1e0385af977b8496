//! Database backup utilities.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rocksdb::backup::BackupEngineInfo;
use tokio::sync::RwLock;

use crate::Store;

#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug)]
pub struct BackupInfo {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

impl From<BackupEngineInfo> for BackupInfo {
    fn from(backup: BackupEngineInfo) -> Self {
        Self {
            id: backup.backup_id,
            timestamp: Utc
                .timestamp_opt(backup.timestamp, 0)
                .single()
                .unwrap_or_default(),
            size: backup.size,
        }
    }
}

/// Creates a new database backup, keeping the specified number of backups.
///
/// # Errors
///
/// Returns an error if backup fails.
pub async fn create(store: &Arc<RwLock<Store>>, flush: bool, backups_to_keep: u32) -> Result<()> {
    let mut store = store.write().await;
    store.backup(flush, backups_to_keep)?;
    tracing::info!("backup created, keeping up to {backups_to_keep}");
    Ok(())
}

/// Lists the backup information of the database.
///
/// # Errors
///
/// Returns an error if backup list fails to create
pub async fn list(store: &Arc<RwLock<Store>>) -> Result<Vec<BackupInfo>> {
    let backup_list = {
        let store = store.read().await;
        store.get_backup_info()?
    };
    Ok(backup_list
        .into_iter()
        .map(std::convert::Into::into)
        .collect())
}

/// Restores the database from a backup with the specified ID, or from the
/// latest backup if no ID is given.
///
/// # Errors
///
/// Returns an error if the restore operation fails.
pub async fn restore(store: &Arc<RwLock<Store>>, backup_id: Option<u32>) -> Result<()> {
    let mut store = store.write().await;
    match &backup_id {
        Some(id) => store.restore_from_backup(*id)?,
        None => store.restore_from_latest_backup()?,
    }
    tracing::info!(
        "database restored from backup {}",
        backup_id.map_or_else(|| "latest".to_string(), |id| id.to_string())
    );
    Ok(())
}
