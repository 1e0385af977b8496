//! The `sensor_data` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

use super::{Table, UniqueKey, Value};
use crate::{
    collections::Map,
    types::{EquipmentId, FromKeyValue, Parameter, ReadingId},
    Iterable,
};

/// The values carried by one sensor sample.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Measurement {
    pub time: DateTime<Utc>,
    /// In rpm.
    pub rotational_speed: f64,
    /// In kelvin.
    pub process_temperature: f64,
    /// In kelvin.
    pub air_temperature: f64,
    /// In newton-metres.
    pub torque: f64,
    /// In minutes.
    pub tool_wear: f64,
    /// Whether the machine reported a failure with this sample.
    pub target: bool,
    pub failure_type: Option<String>,
}

impl Measurement {
    #[must_use]
    pub fn value(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::RotationalSpeed => self.rotational_speed,
            Parameter::ProcessTemperature => self.process_temperature,
            Parameter::AirTemperature => self.air_temperature,
            Parameter::Torque => self.torque,
            Parameter::ToolWear => self.tool_wear,
        }
    }

    /// How much hotter the process runs than the surrounding air, in kelvin.
    #[must_use]
    pub fn temperature_difference(&self) -> f64 {
        self.process_temperature - self.air_temperature
    }

    /// Mechanical power at the spindle, in watts.
    #[must_use]
    pub fn power(&self) -> f64 {
        self.torque * self.rotational_speed * std::f64::consts::TAU / 60.0
    }

    /// Torque per rpm. A stalled machine divides by one rather than zero.
    #[must_use]
    pub fn torque_speed_ratio(&self) -> f64 {
        self.torque / (self.rotational_speed + 1.0)
    }
}

/// A stored reading. Readings are never updated.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SensorReading {
    pub id: ReadingId,
    pub equipment_id: EquipmentId,
    pub measurement: Measurement,
}

impl SensorReading {
    pub(crate) fn key(
        equipment_id: EquipmentId,
        time: &DateTime<Utc>,
        id: ReadingId,
    ) -> Result<Vec<u8>> {
        let mut key = Self::time_prefix(equipment_id, time)?;
        key.extend(id.to_be_bytes());
        Ok(key)
    }

    fn time_prefix(equipment_id: EquipmentId, time: &DateTime<Utc>) -> Result<Vec<u8>> {
        let mut key = equipment_id.to_be_bytes().to_vec();
        key.extend(super::time_key(time)?);
        Ok(key)
    }
}

impl FromKeyValue for SensorReading {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl UniqueKey for SensorReading {
    fn unique_key(&self) -> Vec<u8> {
        Self::key(self.equipment_id, &self.measurement.time, self.id)
            .expect("timestamp validated on ingestion")
    }
}

impl Value for SensorReading {
    fn value(&self) -> Vec<u8> {
        super::serialize(self).expect("serializable")
    }
}

/// Functions for the `sensor_data` map.
impl<'d> Table<'d, SensorReading> {
    /// Opens the `sensor_data` table in the database.
    ///
    /// Returns `None` if the table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        Map::open(db, super::SENSOR_DATA).map(Table::new)
    }

    /// Returns the readings of an equipment in timestamp order, starting at
    /// `since` (inclusive) if given.
    ///
    /// # Errors
    ///
    /// Returns an error if `since` is out of range or the database query fails.
    pub fn readings(
        &self,
        equipment_id: EquipmentId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Vec<SensorReading>> {
        let prefix = equipment_id.to_be_bytes();
        let from = since
            .map(|since| SensorReading::time_prefix(equipment_id, since))
            .transpose()?;
        self.prefix_iter(Direction::Forward, from.as_deref(), &prefix)
            .collect()
    }

    /// Returns the most recent reading of an equipment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn latest(&self, equipment_id: EquipmentId) -> Result<Option<SensorReading>> {
        self.prefix_iter(Direction::Reverse, None, &equipment_id.to_be_bytes())
            .next()
            .transpose()
    }

    /// Checks in `txn` that `reading` is stored.
    pub(crate) fn contains_for_update(
        &self,
        reading: &SensorReading,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<bool> {
        let key = SensorReading::key(reading.equipment_id, &reading.measurement.time, reading.id)?;
        Ok(self.map.get_for_update(&key, txn)?.is_some())
    }

    /// Deletes every reading of an equipment in `txn`.
    pub(crate) fn delete_by_equipment(
        &self,
        equipment_id: EquipmentId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<usize> {
        self.map
            .delete_prefix_with_transaction(&equipment_id.to_be_bytes(), txn)
            .context("cannot delete readings")
    }
}
