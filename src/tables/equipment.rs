//! The `equipments` table.

use std::borrow::Cow;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rocksdb::{Direction, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

use super::{Table, UniqueKey, Value};
use crate::{
    collections::{IndexedMapUpdate, Map},
    types::{EquipmentId, EquipmentStatus, FromKeyValue},
    Iterable,
};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub name: String,
    pub equipment_type: String,
    pub location: String,
    pub installation_date: NaiveDate,
    status: EquipmentStatus,
    open_tickets: u32,
    last_reading_time: Option<DateTime<Utc>>,
}

impl Equipment {
    pub(crate) fn new(
        id: EquipmentId,
        name: String,
        equipment_type: String,
        location: String,
        installation_date: NaiveDate,
        status: EquipmentStatus,
    ) -> Self {
        Self {
            id,
            name,
            equipment_type,
            location,
            installation_date,
            status,
            open_tickets: 0,
            last_reading_time: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> EquipmentStatus {
        self.status
    }

    /// The number of tickets against this equipment that are open or in
    /// progress.
    #[must_use]
    pub fn open_tickets(&self) -> u32 {
        self.open_tickets
    }

    /// The timestamp of the most recent stored reading.
    #[must_use]
    pub fn last_reading_time(&self) -> Option<DateTime<Utc>> {
        self.last_reading_time
    }

    pub(crate) fn set_last_reading_time(&mut self, time: DateTime<Utc>) {
        self.last_reading_time = Some(time);
    }

    /// Counts a newly opened ticket, putting active equipment under
    /// maintenance.
    pub(crate) fn claim_ticket(&mut self) {
        self.open_tickets += 1;
        if self.status == EquipmentStatus::Active {
            self.status = EquipmentStatus::Maintenance;
        }
    }

    /// Counts a ticket that left the open set. Equipment under maintenance
    /// becomes active again once no open ticket remains.
    pub(crate) fn release_ticket(&mut self) {
        self.open_tickets = self.open_tickets.saturating_sub(1);
        if self.open_tickets == 0 && self.status == EquipmentStatus::Maintenance {
            self.status = EquipmentStatus::Active;
        }
    }

    pub(crate) fn key(id: EquipmentId) -> [u8; 4] {
        id.to_be_bytes()
    }
}

impl FromKeyValue for Equipment {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl UniqueKey for Equipment {
    fn unique_key(&self) -> Vec<u8> {
        Self::key(self.id).to_vec()
    }
}

impl Value for Equipment {
    fn value(&self) -> Vec<u8> {
        super::serialize(self).expect("serializable")
    }
}

/// Functions for the `equipments` map.
impl<'d> Table<'d, Equipment> {
    /// Opens the `equipments` table in the database.
    ///
    /// Returns `None` if the table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        Map::open(db, super::EQUIPMENTS).map(Table::new)
    }

    /// Returns the equipment with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get(&self, id: EquipmentId) -> Result<Option<Equipment>> {
        self.get_record(&Equipment::key(id))
    }

    /// Reads the equipment in `txn`, so that a concurrent change to it makes
    /// `txn` fail on commit.
    pub(crate) fn get_for_update(
        &self,
        id: EquipmentId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<Option<Equipment>> {
        self.get_record_for_update(&Equipment::key(id), txn)
    }

    /// Returns all equipment in ID order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a record is invalid.
    pub fn list(&self) -> Result<Vec<Equipment>> {
        self.iter(Direction::Forward, None).collect()
    }
}

/// The descriptive fields of an equipment record that may be changed after
/// registration.
#[derive(Clone, Debug, Default)]
pub struct Update {
    pub name: Option<String>,
    pub location: Option<String>,
}

impl IndexedMapUpdate for Update {
    type Entry = Equipment;

    fn key(&self) -> Option<Cow<'_, [u8]>> {
        None
    }

    fn apply(&self, mut value: Self::Entry) -> Result<Self::Entry> {
        if let Some(name) = self.name.as_deref() {
            name.clone_into(&mut value.name);
        }
        if let Some(location) = self.location.as_deref() {
            location.clone_into(&mut value.location);
        }
        Ok(value)
    }

    fn verify(&self, value: &Self::Entry) -> bool {
        if let Some(name) = self.name.as_deref() {
            if name != value.name {
                return false;
            }
        }
        if let Some(location) = self.location.as_deref() {
            if location != value.location {
                return false;
            }
        }
        true
    }
}
