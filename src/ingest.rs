//! Intake of sensor readings.

use crate::{
    clock::Clock,
    collections::with_transaction,
    evaluator,
    tables::{
        AnomalyLog, SensorReading, ANOMALY_SEQUENCE, READING_SEQUENCE, RECOMMENDATION_SEQUENCE,
    },
    Equipment, EquipmentId, EquipmentStatus, Error, Measurement, ReadingId, Store,
};

impl Store {
    /// Stores a reading, then records the anomalies found in it and the
    /// recommendations they call for, all in one transaction.
    ///
    /// # Errors
    ///
    /// * `Error::Validation` if a value is not finite or not plausible.
    /// * `Error::NotFound` if there is no such equipment.
    /// * `Error::InvalidState` if the equipment is down.
    /// * `Error::OutOfOrder` if the reading is older than the latest one
    ///   stored for the equipment.
    /// * Another error if the evaluation or a database operation fails, in
    ///   which case nothing is stored.
    pub fn ingest<C: Clock>(
        &self,
        equipment_id: EquipmentId,
        measurement: Measurement,
        clock: &C,
    ) -> Result<ReadingId, Error> {
        self.config.limits.check(&measurement)?;
        if crate::tables::time_key(&measurement.time).is_err() {
            return Err(Error::Validation(format!(
                "timestamp out of range: {}",
                measurement.time
            )));
        }

        let equipment = self.equipment(equipment_id)?;
        check_accepts(&equipment, &measurement)?;

        let detections = evaluator::evaluate(
            &equipment.equipment_type,
            &measurement,
            &self.threshold_map(),
        )?;
        let min_severity = self.config.recommendation.min_severity;

        let now = clock.now();
        let reading_sequence = self.states.sequence(READING_SEQUENCE);
        let anomaly_sequence = self.states.sequence(ANOMALY_SEQUENCE);
        let recommendation_sequence = self.states.sequence(RECOMMENDATION_SEQUENCE);
        let equipments = self.equipment_map();
        let readings = self.sensor_data_map();
        let anomalies = self.anomaly_log_map();
        let recommendations = self.recommendation_map();
        let reading_id = with_transaction(self.states.db(), |txn| {
            let mut equipment = equipments
                .get_for_update(equipment_id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {equipment_id}")))?;
            check_accepts(&equipment, &measurement)?;

            let reading = SensorReading {
                id: reading_sequence.next(txn)?,
                equipment_id,
                measurement: measurement.clone(),
            };
            readings.insert_with_transaction(&reading, txn)?;
            equipment.set_last_reading_time(measurement.time);
            equipments.put_with_transaction(&equipment, txn)?;

            for detection in &detections {
                let anomaly = AnomalyLog {
                    id: anomaly_sequence.next(txn)?,
                    equipment_id,
                    reading_id: reading.id,
                    kind: detection.kind.clone(),
                    severity: detection.severity,
                    confidence: detection.confidence,
                    value: detection.value,
                    reading_time: measurement.time,
                    detected_at: now,
                };
                anomalies.insert_with_transaction(&anomaly, txn)?;
                if detection.severity >= min_severity {
                    let recommendation = self.compose_recommendation(
                        &equipment.equipment_type,
                        &anomaly,
                        recommendation_sequence.next(txn)?,
                        now,
                    )?;
                    recommendations.insert_with_transaction(&recommendation, txn)?;
                }
            }
            Ok::<_, Error>(reading.id)
        })?;

        if detections.is_empty() {
            tracing::debug!("reading {reading_id} of equipment {equipment_id} is normal");
        } else {
            tracing::info!(
                "reading {reading_id} of equipment {equipment_id}: {} anomalies",
                detections.len()
            );
        }
        Ok(reading_id)
    }

    /// Returns the readings of an equipment in timestamp order, starting at
    /// `since` (inclusive) if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn readings(
        &self,
        equipment_id: EquipmentId,
        since: Option<&chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<SensorReading>, Error> {
        Ok(self.sensor_data_map().readings(equipment_id, since)?)
    }

    /// Returns the most recent reading of an equipment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn latest_reading(
        &self,
        equipment_id: EquipmentId,
    ) -> Result<Option<SensorReading>, Error> {
        Ok(self.sensor_data_map().latest(equipment_id)?)
    }
}

fn check_accepts(equipment: &Equipment, measurement: &Measurement) -> Result<(), Error> {
    if equipment.status() == EquipmentStatus::Down {
        return Err(Error::InvalidState(format!("equipment {} is down", equipment.id)));
    }
    if let Some(latest) = equipment.last_reading_time() {
        if measurement.time < latest {
            return Err(Error::OutOfOrder {
                time: measurement.time,
                latest,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::{
        policy::EngineConfig, test, AnomalyKind, Direction, EquipmentStatus, Error, Measurement,
        Parameter, Severity,
    };

    #[test]
    fn normal_reading_has_no_anomalies() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        let reading_id = store.ingest(id, test::normal(0), &test::clock(0)).unwrap();
        assert!(store.anomalies(id, None).unwrap().is_empty());
        let latest = store.latest_reading(id).unwrap().unwrap();
        assert_eq!(latest.id, reading_id);
        assert_eq!(
            store.equipment(id).unwrap().last_reading_time(),
            Some(test::at(0))
        );
    }

    #[test]
    fn pump_example() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        let reading = Measurement {
            process_temperature: 311.0,
            ..test::normal(0)
        };
        let reading_id = store.ingest(id, reading, &test::clock(1)).unwrap();

        let anomalies = store.anomalies(id, None).unwrap();
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.reading_id, reading_id);
        assert_eq!(anomaly.severity, Severity::Medium);
        assert_eq!(
            anomaly.kind,
            AnomalyKind::OutOfRange {
                parameter: Parameter::ProcessTemperature,
                direction: Direction::Above,
            }
        );
        assert!((anomaly.confidence - 0.2).abs() < 1e-9);
        assert_eq!(anomaly.reading_time, test::at(0));
        assert_eq!(anomaly.detected_at, test::at(1));
        assert!(store.recommendations(id).unwrap().is_empty());
    }

    #[test]
    fn high_anomalies_get_recommendations() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        let reading = Measurement {
            torque: 75.0,
            rotational_speed: 1100.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();

        let anomalies = store.anomalies(id, None).unwrap();
        assert_eq!(anomalies.len(), 2);
        let recommendations = store.recommendations(id).unwrap();
        assert_eq!(recommendations.len(), 1);
        let torque = anomalies
            .iter()
            .find(|a| a.kind.parameter() == Some(Parameter::Torque))
            .unwrap();
        assert_eq!(torque.severity, Severity::High);
        assert_eq!(recommendations[0].anomaly_id, torque.id);
        assert_eq!(recommendations[0].generated_at, test::at(0));
    }

    #[test]
    fn failure_flag() {
        let store = test::setup_store();
        let id = test::register(&store, "lathe");
        let reading = Measurement {
            target: true,
            failure_type: Some("Tool Wear Failure".to_string()),
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();

        let anomalies = store.anomalies(id, None).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert!((anomalies[0].confidence - 1.0).abs() < f64::EPSILON);
        let recommendation = store.recommendations(id).unwrap().remove(0);
        assert_eq!(
            recommendation.action,
            "Stop the lathe and inspect it for Tool Wear Failure."
        );
        assert_eq!(
            recommendation.predicted_failure_at - recommendation.generated_at,
            chrono::Duration::minutes(30)
        );
    }

    #[test]
    fn rejections() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        let bad = Measurement {
            torque: f64::NAN,
            ..test::normal(0)
        };
        assert!(matches!(
            store.ingest(id, bad, &test::clock(0)),
            Err(Error::Validation(_))
        ));
        let implausible = Measurement {
            air_temperature: 150.0,
            ..test::normal(0)
        };
        assert!(matches!(
            store.ingest(id, implausible, &test::clock(0)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.ingest(id + 1, test::normal(0), &test::clock(0)),
            Err(Error::NotFound(_))
        ));

        store.ingest(id, test::normal(10), &test::clock(10)).unwrap();
        store.ingest(id, test::normal(10), &test::clock(10)).unwrap();
        assert!(matches!(
            store.ingest(id, test::normal(5), &test::clock(11)),
            Err(Error::OutOfOrder { .. })
        ));
        assert_eq!(store.readings(id, None).unwrap().len(), 2);

        let down = store
            .register_equipment(
                "pump-2",
                "pump",
                "",
                NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                EquipmentStatus::Down,
            )
            .unwrap();
        assert!(matches!(
            store.ingest(down, test::normal(0), &test::clock(0)),
            Err(Error::InvalidState(_))
        ));
        assert!(store.readings(down, None).unwrap().is_empty());
    }

    #[test]
    fn readings_since() {
        let store = test::setup_store();
        let id = test::register(&store, "pump");
        let mut ids = Vec::new();
        for minutes in [0, 5, 10] {
            ids.push(
                store
                    .ingest(id, test::normal(minutes), &test::clock(minutes))
                    .unwrap(),
            );
        }
        let since: Vec<_> = store
            .readings(id, Some(&test::at(5)))
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(since, ids[1..]);
    }

    #[test]
    fn configured_min_severity() {
        let mut config = EngineConfig::default();
        config.recommendation.min_severity = Severity::Medium;
        let store = test::setup_store_with(config);
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        let reading = Measurement {
            process_temperature: 311.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();
        assert_eq!(store.recommendations(id).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_ingest_keeps_every_reading() {
        const FEEDS: usize = 8;
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let id = test::register(&store, "pump");

        std::thread::scope(|s| {
            for _ in 0..FEEDS {
                let store = &store;
                s.spawn(move || {
                    let hot = Measurement {
                        process_temperature: 320.0,
                        ..test::normal(0)
                    };
                    store.ingest(id, hot, &test::clock(0)).unwrap();
                });
            }
        });

        let readings = store.readings(id, None).unwrap();
        assert_eq!(readings.len(), FEEDS);
        let anomalies = store.anomalies(id, None).unwrap();
        assert_eq!(anomalies.len(), FEEDS);
        // Anomalies list in the order their readings were committed.
        let reading_ids: Vec<_> = readings.iter().map(|r| r.id).collect();
        let anomaly_readings: Vec<_> = anomalies.iter().map(|a| a.reading_id).collect();
        assert_eq!(anomaly_readings, reading_ids);
        assert_eq!(store.recommendations(id).unwrap().len(), FEEDS);
        assert_eq!(
            store.equipment(id).unwrap().last_reading_time(),
            Some(test::at(0))
        );
    }
}
