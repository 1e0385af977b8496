//! Generation of maintenance recommendations from anomalies.

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::{
    clock::Clock, collections::with_transaction, tables::RECOMMENDATION_SEQUENCE, AnomalyLog,
    EquipmentId, Error, Recommendation, RecommendationId, Store,
};

impl Store {
    /// Returns the recommendation for an anomaly, generating it first if the
    /// anomaly has none yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the anomaly is less severe than the
    /// configured minimum, `Error::NotFound` if the anomaly or its equipment
    /// is not stored, or another error if the database operation fails.
    pub fn generate_recommendation<C: Clock>(
        &self,
        anomaly: &AnomalyLog,
        clock: &C,
    ) -> Result<Recommendation, Error> {
        let min_severity = self.config.recommendation.min_severity;
        if anomaly.severity < min_severity {
            return Err(Error::InvalidState(format!(
                "anomaly {} is {}, below {min_severity}",
                anomaly.id, anomaly.severity
            )));
        }

        let table = self.recommendation_map();
        if let Some(existing) = table.get_by_anomaly(anomaly.id)? {
            tracing::debug!(
                "anomaly {} already has recommendation {}",
                anomaly.id,
                existing.id
            );
            return Ok(existing);
        }
        // The caller's copy may be stale or made up; generate from the log.
        let anomaly = self.anomaly(anomaly.equipment_id, anomaly.id)?;

        let now = clock.now();
        let sequence = self.states.sequence(RECOMMENDATION_SEQUENCE);
        let equipments = self.equipment_map();
        let (recommendation, created) = with_transaction(self.states.db(), |txn| {
            let equipment = equipments
                .get_for_update(anomaly.equipment_id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {}", anomaly.equipment_id)))?;
            if let Some(existing) = table.get_by_anomaly_for_update(anomaly.id, txn)? {
                return Ok((existing, false));
            }
            let id = sequence.next(txn)?;
            let recommendation =
                self.compose_recommendation(&equipment.equipment_type, &anomaly, id, now)?;
            equipments.put_with_transaction(&equipment, txn)?;
            table.insert_with_transaction(&recommendation, txn)?;
            Ok::<_, Error>((recommendation, true))
        })?;
        if created {
            tracing::info!(
                "recommendation {} for anomaly {} on equipment {}",
                recommendation.id,
                anomaly.id,
                anomaly.equipment_id
            );
        }
        Ok(recommendation)
    }

    /// Returns the recommendation with the given ID made for an equipment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such recommendation.
    pub fn recommendation(
        &self,
        equipment_id: EquipmentId,
        id: RecommendationId,
    ) -> Result<Recommendation, Error> {
        self.recommendation_map()
            .get(equipment_id, id)?
            .ok_or_else(|| {
                Error::NotFound(format!("recommendation {id} of equipment {equipment_id}"))
            })
    }

    /// Returns the recommendations made for an equipment in the order they
    /// were generated.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn recommendations(&self, equipment_id: EquipmentId) -> Result<Vec<Recommendation>, Error> {
        Ok(self.recommendation_map().list_by_equipment(equipment_id)?)
    }

    /// Builds the recommendation for `anomaly` from the matching rule.
    pub(crate) fn compose_recommendation(
        &self,
        equipment_type: &str,
        anomaly: &AnomalyLog,
        id: RecommendationId,
        now: DateTime<Utc>,
    ) -> Result<Recommendation, Error> {
        let template = self
            .config
            .recommendation
            .template_for(equipment_type, anomaly.kind.category());
        let horizon = template.horizon_for(anomaly.severity, anomaly.confidence);
        let predicted_failure_at = chrono::Duration::from_std(horizon)
            .ok()
            .and_then(|horizon| now.checked_add_signed(horizon))
            .ok_or_else(|| anyhow!("failure horizon {horizon:?} out of range"))?;
        Ok(Recommendation {
            id,
            equipment_id: anomaly.equipment_id,
            anomaly_id: anomaly.id,
            action: template.render(equipment_type, &anomaly.kind, anomaly.severity),
            predicted_failure_at,
            generated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::{
        policy::{EngineConfig, Rule, Template},
        test, Error, Measurement, Severity,
    };

    #[test]
    fn generation_is_idempotent() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");
        let reading = Measurement {
            process_temperature: 318.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();

        let anomaly = store.anomalies(id, None).unwrap().remove(0);
        let generated = store.recommendations(id).unwrap().remove(0);
        assert_eq!(generated.anomaly_id, anomaly.id);

        let again = store
            .generate_recommendation(&anomaly, &test::clock(60))
            .unwrap();
        assert_eq!(again, generated);
        assert_eq!(store.recommendations(id).unwrap().len(), 1);
        assert_eq!(store.recommendation(id, generated.id).unwrap(), generated);
        assert!(matches!(
            store.recommendation(id, generated.id + 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn recorded_anomaly_is_recommended() {
        let store = test::setup_store();
        let id = test::register(&store, "pump");
        store.ingest(id, test::normal(0), &test::clock(0)).unwrap();
        let reading = store.latest_reading(id).unwrap().unwrap();
        let detection = crate::evaluator::classify(
            &crate::Threshold::new(
                "pump",
                crate::Parameter::ProcessTemperature,
                (300.0, 304.0),
                (299.0, 304.4),
            ),
            reading.measurement.process_temperature,
        )
        .unwrap();
        assert_eq!(detection.severity, Severity::High);
        let anomaly_id = store
            .record_anomaly(&reading, detection, &test::clock(1))
            .unwrap();
        let anomaly = store.anomaly(id, anomaly_id).unwrap();

        let recommendation = store.recommendations(id).unwrap().remove(0);
        assert_eq!(recommendation.anomaly_id, anomaly_id);
        assert_eq!(recommendation.generated_at, test::at(1));
        // 72h base at full confidence
        assert_eq!(
            recommendation.predicted_failure_at - recommendation.generated_at,
            Duration::hours(18)
        );
        assert_eq!(
            recommendation.action,
            "Inspect cooling and lubrication of the pump: process temperature is above the normal range (high)."
        );
        let again = store
            .generate_recommendation(&anomaly, &test::clock(3))
            .unwrap();
        assert_eq!(again, recommendation);
        assert_eq!(store.recommendations(id).unwrap().len(), 1);
    }

    #[test]
    fn below_min_severity() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");
        let reading = Measurement {
            process_temperature: 311.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();
        let anomaly = store.anomalies(id, None).unwrap().remove(0);
        assert!(matches!(
            store.generate_recommendation(&anomaly, &test::clock(0)),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn unknown_anomaly() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");
        let reading = Measurement {
            torque: 80.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();
        let mut anomaly = store.anomalies(id, None).unwrap().remove(0);
        anomaly.id += 50;
        assert!(matches!(
            store.generate_recommendation(&anomaly, &test::clock(0)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn type_specific_rule() {
        let mut config = EngineConfig::default();
        config.recommendation.rules.insert(
            0,
            Rule {
                equipment_type: "pump".to_string(),
                category: "torque".to_string(),
                template: Template {
                    action: "Check the {equipment_type} impeller for {severity} torque.".to_string(),
                    horizon: std::time::Duration::from_secs(40 * 3600),
                },
            },
        );
        let store = test::setup_store_with(config);
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");
        let reading = Measurement {
            torque: 80.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();

        let recommendation = store.recommendations(id).unwrap().remove(0);
        assert_eq!(recommendation.action, "Check the pump impeller for high torque.");
        assert_eq!(
            recommendation.predicted_failure_at - recommendation.generated_at,
            Duration::hours(10)
        );
    }
}
