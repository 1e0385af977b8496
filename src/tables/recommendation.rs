//! The `maintenance_recommendations` table and its anomaly index.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

use super::UniqueKey;
use crate::{
    collections::Map,
    types::{AnomalyId, EquipmentId, FromKeyValue, RecommendationId},
};

/// A maintenance action generated for one anomaly.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub equipment_id: EquipmentId,
    pub anomaly_id: AnomalyId,
    pub action: String,
    /// When the equipment is expected to fail if nothing is done.
    pub predicted_failure_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    pub(crate) fn key(equipment_id: EquipmentId, id: RecommendationId) -> [u8; 8] {
        let mut key = [0; 8];
        key[..4].copy_from_slice(&equipment_id.to_be_bytes());
        key[4..].copy_from_slice(&id.to_be_bytes());
        key
    }
}

impl FromKeyValue for Recommendation {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl UniqueKey for Recommendation {
    fn unique_key(&self) -> Vec<u8> {
        Self::key(self.equipment_id, self.id).to_vec()
    }
}

/// Recommendations together with the index that maps each anomaly to the
/// single recommendation generated for it.
pub struct Table<'d> {
    recommendations: Map<'d>,
    by_anomaly: Map<'d>,
}

impl<'d> Table<'d> {
    /// Opens the recommendation tables in the database.
    ///
    /// Returns `None` if either table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        let recommendations = Map::open(db, super::MAINTENANCE_RECOMMENDATIONS)?;
        let by_anomaly = Map::open(db, super::RECOMMENDATION_ANOMALIES)?;
        Some(Self {
            recommendations,
            by_anomaly,
        })
    }

    /// Returns the recommendation with the given ID made for an equipment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get(
        &self,
        equipment_id: EquipmentId,
        id: RecommendationId,
    ) -> Result<Option<Recommendation>> {
        let key = Recommendation::key(equipment_id, id);
        self.recommendations
            .get(&key)?
            .map(|value| Recommendation::from_key_value(&key, &value))
            .transpose()
    }

    /// Returns the recommendation generated for an anomaly.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or the index is corrupt.
    pub fn get_by_anomaly(&self, anomaly_id: AnomalyId) -> Result<Option<Recommendation>> {
        let Some(key) = self.by_anomaly.get(&anomaly_id.to_be_bytes())? else {
            return Ok(None);
        };
        let value = self
            .recommendations
            .get(&key)?
            .context("recommendation index points to a missing entry")?;
        Recommendation::from_key_value(&key, &value).map(Some)
    }

    /// Looks up the recommendation for an anomaly in `txn`, so that a
    /// concurrent generation for the same anomaly makes `txn` fail on commit.
    pub(crate) fn get_by_anomaly_for_update(
        &self,
        anomaly_id: AnomalyId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<Option<Recommendation>> {
        let Some(key) = self
            .by_anomaly
            .get_for_update(&anomaly_id.to_be_bytes(), txn)?
        else {
            return Ok(None);
        };
        let value = self
            .recommendations
            .get_for_update(&key, txn)?
            .context("recommendation index points to a missing entry")?;
        Recommendation::from_key_value(&key, &value).map(Some)
    }

    /// Stores a new recommendation and its index entry in `txn`.
    pub(crate) fn insert_with_transaction(
        &self,
        recommendation: &Recommendation,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        let key = recommendation.unique_key();
        self.by_anomaly
            .insert_with_transaction(&recommendation.anomaly_id.to_be_bytes(), &key, txn)
            .context("anomaly already has a recommendation")?;
        self.recommendations
            .insert_with_transaction(&key, &super::serialize(recommendation)?, txn)
    }

    /// Returns the recommendations made for an equipment in the order they
    /// were generated.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a record is invalid.
    pub fn list_by_equipment(&self, equipment_id: EquipmentId) -> Result<Vec<Recommendation>> {
        self.recommendations
            .inner_prefix_iterator(Direction::Forward, None, &equipment_id.to_be_bytes())
            .map(|item| {
                let (key, value) = item?;
                Recommendation::from_key_value(&key, &value)
            })
            .collect()
    }

    /// Deletes every recommendation of an equipment and their index entries
    /// in `txn`.
    pub(crate) fn delete_by_equipment(
        &self,
        equipment_id: EquipmentId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<usize> {
        let recommendations = self.list_by_equipment(equipment_id)?;
        for recommendation in &recommendations {
            self.by_anomaly
                .delete_with_transaction(&recommendation.anomaly_id.to_be_bytes(), txn)?;
            self.recommendations
                .delete_with_transaction(&recommendation.unique_key(), txn)?;
        }
        Ok(recommendations.len())
    }
}
