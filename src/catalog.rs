//! Administration of the threshold catalog.

use crate::{
    collections::Refused, evaluator::ThresholdCatalog, types::Parameter, Error, Store, Threshold,
    ThresholdUpdate,
};

impl Store {
    /// Returns the threshold for `parameter` on equipment of the given type.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such threshold is configured.
    pub fn threshold(
        &self,
        equipment_type: &str,
        parameter: Parameter,
    ) -> Result<Threshold, Error> {
        self.threshold_map().lookup(equipment_type, parameter)
    }

    /// Returns every configured threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn thresholds(&self) -> Result<Vec<Threshold>, Error> {
        Ok(self.threshold_map().list()?)
    }

    /// Adds a threshold to the catalog and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the bounds are not nested and finite,
    /// `Error::InvalidState` if a threshold for the same equipment type and
    /// parameter exists, or another error if the database operation fails.
    pub fn insert_threshold(&self, threshold: Threshold) -> Result<u32, Error> {
        threshold.validate().map_err(Error::Validation)?;
        let subject = format!(
            "threshold for {} {}",
            threshold.equipment_type, threshold.parameter
        );
        self.threshold_map()
            .insert(threshold)
            .map_err(|e| refused(e, &subject))
    }

    /// Replaces the bounds of a threshold, provided they are still `old`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `new` is not nested and finite,
    /// `Error::NotFound` if there is no threshold with `id`,
    /// `Error::InvalidState` if the stored bounds differ from `old`, or another
    /// error if the database operation fails.
    pub fn update_threshold(
        &self,
        id: u32,
        old: &ThresholdUpdate,
        new: &ThresholdUpdate,
    ) -> Result<(), Error> {
        new.validate().map_err(Error::Validation)?;
        self.threshold_map()
            .update(id, old, new)
            .map_err(|e| refused(e, &format!("threshold {id}")))
    }

    /// Removes a threshold from the catalog.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no threshold with `id`, or another
    /// error if the database operation fails.
    pub fn remove_threshold(&self, id: u32) -> Result<(), Error> {
        self.threshold_map()
            .remove(id)
            .map_err(|e| refused(e, &format!("threshold {id}")))?;
        Ok(())
    }
}

/// Tells apart writes turned down by the catalog's contents from database
/// failures.
fn refused(e: anyhow::Error, subject: &str) -> Error {
    match e.downcast_ref::<Refused>() {
        Some(Refused::KeyExists) => Error::InvalidState(format!("{subject} already exists")),
        Some(Refused::EntryChanged) => Error::InvalidState(format!("{subject} has changed")),
        Some(Refused::NoSuchId) => Error::NotFound(subject.to_string()),
        None => Error::Database(e),
    }
}
