//! The append-only anomaly log.

use chrono::{DateTime, Utc};

use crate::{
    clock::Clock,
    collections::with_transaction,
    tables::{ANOMALY_SEQUENCE, RECOMMENDATION_SEQUENCE},
    AnomalyId, AnomalyLog, Detection, EquipmentId, Error, SensorReading, Store,
};

impl Store {
    /// Records an anomaly found in a stored reading and returns its ID.
    ///
    /// If the anomaly is at least as severe as the configured minimum, its
    /// recommendation is generated in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the confidence is outside `[0, 1]`,
    /// `Error::NotFound` if the reading or its equipment is not stored, or
    /// another error if the database operation fails.
    pub fn record_anomaly<C: Clock>(
        &self,
        reading: &SensorReading,
        detection: Detection,
        clock: &C,
    ) -> Result<AnomalyId, Error> {
        if !(0.0..=1.0).contains(&detection.confidence) {
            return Err(Error::Validation(format!(
                "confidence {} outside [0, 1]",
                detection.confidence
            )));
        }

        let now = clock.now();
        let recommend = detection.severity >= self.config.recommendation.min_severity;
        let anomaly_sequence = self.states.sequence(ANOMALY_SEQUENCE);
        let recommendation_sequence = self.states.sequence(RECOMMENDATION_SEQUENCE);
        let equipments = self.equipment_map();
        let readings = self.sensor_data_map();
        let anomalies = self.anomaly_log_map();
        let recommendations = self.recommendation_map();
        let (anomaly, recommendation) = with_transaction(self.states.db(), |txn| {
            let equipment = equipments
                .get_for_update(reading.equipment_id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {}", reading.equipment_id)))?;
            if !readings.contains_for_update(reading, txn)? {
                return Err(Error::NotFound(format!("reading {}", reading.id)));
            }
            // Writing the equipment back orders this against a concurrent
            // removal of the equipment.
            equipments.put_with_transaction(&equipment, txn)?;

            let anomaly = AnomalyLog {
                id: anomaly_sequence.next(txn)?,
                equipment_id: reading.equipment_id,
                reading_id: reading.id,
                kind: detection.kind.clone(),
                severity: detection.severity,
                confidence: detection.confidence,
                value: detection.value,
                reading_time: reading.measurement.time,
                detected_at: now,
            };
            anomalies.insert_with_transaction(&anomaly, txn)?;
            let recommendation = if recommend {
                let id = recommendation_sequence.next(txn)?;
                let recommendation =
                    self.compose_recommendation(&equipment.equipment_type, &anomaly, id, now)?;
                recommendations.insert_with_transaction(&recommendation, txn)?;
                Some(recommendation.id)
            } else {
                None
            };
            Ok((anomaly, recommendation))
        })?;
        tracing::info!(
            "anomaly {} on equipment {}: {} ({})",
            anomaly.id,
            anomaly.equipment_id,
            anomaly.kind,
            anomaly.severity
        );
        if let Some(id) = recommendation {
            tracing::info!("recommendation {id} for anomaly {}", anomaly.id);
        }
        Ok(anomaly.id)
    }

    /// Returns the anomaly with the given ID recorded for an equipment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such anomaly.
    pub fn anomaly(&self, equipment_id: EquipmentId, id: AnomalyId) -> Result<AnomalyLog, Error> {
        self.anomaly_log_map()
            .get(equipment_id, id)?
            .ok_or_else(|| Error::NotFound(format!("anomaly {id} of equipment {equipment_id}")))
    }

    /// Returns the anomalies of an equipment in the order they were recorded,
    /// limited to readings taken at or after `since` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn anomalies(
        &self,
        equipment_id: EquipmentId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<Vec<AnomalyLog>, Error> {
        Ok(self
            .anomaly_log_map()
            .list_by_equipment(equipment_id, since)?)
    }
}
