//! The `thresholds` table.

use std::borrow::Cow;

use anyhow::Result;
use rocksdb::{Direction, OptimisticTransactionDB};
use serde::{Deserialize, Serialize};

use super::IndexedTable;
use crate::{
    collections::{Indexable, Indexed, IndexedMap, IndexedMapUpdate},
    types::{FromKeyValue, Parameter},
};

/// Normal and warning bounds of one parameter for one type of equipment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Threshold {
    pub id: u32,
    pub equipment_type: String,
    pub parameter: Parameter,
    pub min_normal: f64,
    pub max_normal: f64,
    pub min_warning: f64,
    pub max_warning: f64,
}

impl Threshold {
    #[must_use]
    pub fn new(
        equipment_type: &str,
        parameter: Parameter,
        normal: (f64, f64),
        warning: (f64, f64),
    ) -> Self {
        Self {
            id: u32::MAX,
            equipment_type: equipment_type.to_string(),
            parameter,
            min_normal: normal.0,
            max_normal: normal.1,
            min_warning: warning.0,
            max_warning: warning.1,
        }
    }

    /// Checks that the bounds are finite and nested.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated condition.
    pub fn validate(&self) -> Result<(), String> {
        if self.equipment_type.is_empty() {
            return Err("equipment type must not be empty".to_string());
        }
        Update::from(self).validate()
    }

    fn create_key(equipment_type: &str, parameter: Parameter) -> Vec<u8> {
        let mut key = equipment_type.as_bytes().to_vec();
        key.push(0);
        key.extend(parameter.as_ref().as_bytes());
        key
    }
}

impl FromKeyValue for Threshold {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl Indexable for Threshold {
    fn key(&self) -> Cow<'_, [u8]> {
        Cow::Owned(Self::create_key(&self.equipment_type, self.parameter))
    }

    fn index(&self) -> u32 {
        self.id
    }

    fn value(&self) -> Vec<u8> {
        super::serialize(self).expect("serializable")
    }

    fn set_index(&mut self, index: u32) {
        self.id = index;
    }
}

/// Functions for the `thresholds` indexed map.
impl<'d> IndexedTable<'d, Threshold> {
    /// Opens the `thresholds` table in the database.
    ///
    /// Returns `None` if the table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        IndexedMap::new(db, super::THRESHOLDS)
            .map(IndexedTable::new)
            .ok()
    }

    /// Returns the threshold for the given equipment type and parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get(&self, equipment_type: &str, parameter: Parameter) -> Result<Option<Threshold>> {
        let key = Threshold::create_key(equipment_type, parameter);
        self.indexed_map
            .get_by_key(&key)?
            .map(|value| super::deserialize(&value))
            .transpose()
    }

    /// Returns the threshold with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get_by_id(&self, id: u32) -> Result<Option<Threshold>> {
        self.indexed_map.get_by_id(id)
    }

    /// Inserts a new threshold and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold for the same equipment type and
    /// parameter exists or the database operation fails.
    pub fn insert(&self, threshold: Threshold) -> Result<u32> {
        self.indexed_map.insert(threshold)
    }

    /// Removes the threshold with the given ID and returns its key.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is invalid or the database operation fails.
    pub fn remove(&self, id: u32) -> Result<Vec<u8>> {
        self.indexed_map.remove(id)
    }

    /// Updates the bounds of the threshold with `id` from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is invalid, the stored bounds don't match
    /// `old`, or the database operation fails.
    pub fn update(&self, id: u32, old: &Update, new: &Update) -> Result<()> {
        self.indexed_map.update(id, old, new)
    }

    /// Returns all thresholds in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a record is invalid.
    pub fn list(&self) -> Result<Vec<Threshold>> {
        self.indexed_map
            .raw_iter(Direction::Forward)
            .map(|item| {
                let (key, value) = item?;
                Threshold::from_key_value(&key, &value)
            })
            .collect()
    }
}

/// The bounds of a threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Update {
    pub min_normal: f64,
    pub max_normal: f64,
    pub min_warning: f64,
    pub max_warning: f64,
}

impl Update {
    /// Checks `min_warning ≤ min_normal ≤ max_normal ≤ max_warning` with every
    /// bound finite.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated condition.
    pub fn validate(&self) -> Result<(), String> {
        let bounds = [
            ("min_warning", self.min_warning),
            ("min_normal", self.min_normal),
            ("max_normal", self.max_normal),
            ("max_warning", self.max_warning),
        ];
        if let Some((name, _)) = bounds.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("{name} must be finite"));
        }
        for pair in bounds.windows(2) {
            let ((lower, a), (upper, b)) = (pair[0], pair[1]);
            if a > b {
                return Err(format!("{lower} ({a}) exceeds {upper} ({b})"));
            }
        }
        Ok(())
    }
}

impl From<&Threshold> for Update {
    fn from(threshold: &Threshold) -> Self {
        Self {
            min_normal: threshold.min_normal,
            max_normal: threshold.max_normal,
            min_warning: threshold.min_warning,
            max_warning: threshold.max_warning,
        }
    }
}

impl IndexedMapUpdate for Update {
    type Entry = Threshold;

    fn key(&self) -> Option<Cow<'_, [u8]>> {
        None
    }

    fn apply(&self, mut value: Self::Entry) -> Result<Self::Entry> {
        if let Err(e) = self.validate() {
            anyhow::bail!(e);
        }
        value.min_normal = self.min_normal;
        value.max_normal = self.max_normal;
        value.min_warning = self.min_warning;
        value.max_warning = self.max_warning;
        Ok(value)
    }

    fn verify(&self, value: &Self::Entry) -> bool {
        let current = Self::from(value);
        [
            (self.min_normal, current.min_normal),
            (self.max_normal, current.max_normal),
            (self.min_warning, current.min_warning),
            (self.max_warning, current.max_warning),
        ]
        .iter()
        .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::{Threshold, Update};
    use crate::{test, types::Parameter};

    #[test]
    fn bound_invariant() {
        let ok = Threshold::new(
            "pump",
            Parameter::ProcessTemperature,
            (300.0, 310.0),
            (295.0, 315.0),
        );
        assert!(ok.validate().is_ok());

        let flat = Threshold::new("pump", Parameter::Torque, (40.0, 40.0), (40.0, 40.0));
        assert!(flat.validate().is_ok());

        let inverted = Threshold::new("pump", Parameter::Torque, (50.0, 40.0), (30.0, 60.0));
        assert!(inverted.validate().is_err());

        let outside = Threshold::new("pump", Parameter::Torque, (30.0, 70.0), (35.0, 60.0));
        assert!(outside.validate().is_err());

        let nan = Threshold::new("pump", Parameter::Torque, (f64::NAN, 40.0), (30.0, 60.0));
        assert_eq!(nan.validate().unwrap_err(), "min_normal must be finite");

        let untyped = Threshold::new("", Parameter::Torque, (30.0, 40.0), (20.0, 60.0));
        assert!(untyped.validate().is_err());
    }

    #[test]
    fn operations() {
        let store = test::setup_store();
        let table = store.threshold_map();

        let threshold = Threshold::new(
            "pump",
            Parameter::ProcessTemperature,
            (300.0, 310.0),
            (295.0, 315.0),
        );
        let id = table.insert(threshold.clone()).unwrap();
        assert!(table.insert(threshold.clone()).is_err());
        table
            .insert(Threshold::new("pump", Parameter::Torque, (30.0, 50.0), (20.0, 60.0)))
            .unwrap();

        let stored = table
            .get("pump", Parameter::ProcessTemperature)
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, id);
        assert!(table.get("fan", Parameter::ProcessTemperature).unwrap().is_none());
        assert_eq!(table.list().unwrap().len(), 2);

        let old = Update::from(&stored);
        let new = Update {
            max_normal: 312.0,
            ..old
        };
        table.update(id, &old, &new).unwrap();
        assert!(table.update(id, &old, &new).is_err());
        let widened = table.get_by_id(id).unwrap().unwrap();
        assert!((widened.max_normal - 312.0).abs() < f64::EPSILON);

        let broken = Update {
            max_normal: 400.0,
            ..new
        };
        assert!(table.update(id, &new, &broken).is_err());

        table.remove(id).unwrap();
        assert!(table
            .get("pump", Parameter::ProcessTemperature)
            .unwrap()
            .is_none());
        assert_eq!(table.list().unwrap().len(), 1);
    }
}
