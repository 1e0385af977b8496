//! Registration, lookup and removal of equipment.

use chrono::NaiveDate;

use crate::{
    collections::{with_transaction, IndexedMapUpdate},
    tables::EQUIPMENT_SEQUENCE,
    AnomalyLog, Equipment, EquipmentId, EquipmentStatus, EquipmentUpdate, Error, Recommendation,
    Store, Ticket,
};

/// An equipment record together with everything recorded against it.
#[derive(Clone, Debug, PartialEq)]
pub struct EquipmentHistory {
    pub equipment: Equipment,
    pub anomalies: Vec<AnomalyLog>,
    pub recommendations: Vec<Recommendation>,
    pub tickets: Vec<Ticket>,
}

impl Store {
    /// Registers a new unit of equipment and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `name` or `equipment_type` is blank, or
    /// another error if the database operation fails.
    pub fn register_equipment(
        &self,
        name: &str,
        equipment_type: &str,
        location: &str,
        installation_date: NaiveDate,
        status: EquipmentStatus,
    ) -> Result<EquipmentId, Error> {
        if name.trim().is_empty() {
            return Err(Error::Validation("equipment name must not be empty".into()));
        }
        if equipment_type.trim().is_empty() {
            return Err(Error::Validation("equipment type must not be empty".into()));
        }

        let sequence = self.states.sequence(EQUIPMENT_SEQUENCE);
        let table = self.equipment_map();
        let id = with_transaction(self.states.db(), |txn| {
            let id = sequence.next(txn)?;
            let equipment = Equipment::new(
                id,
                name.to_string(),
                equipment_type.to_string(),
                location.to_string(),
                installation_date,
                status,
            );
            table.insert_with_transaction(&equipment, txn)?;
            Ok::<_, Error>(id)
        })?;
        tracing::info!("registered {equipment_type} \"{name}\" as equipment {id}");
        Ok(id)
    }

    /// Returns the equipment with the given ID.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such equipment.
    pub fn equipment(&self, id: EquipmentId) -> Result<Equipment, Error> {
        self.equipment_map()
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("equipment {id}")))
    }

    /// Returns all equipment in ID order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn equipments(&self) -> Result<Vec<Equipment>, Error> {
        Ok(self.equipment_map().list()?)
    }

    /// Changes the name or location of an equipment, provided the fields set
    /// in `old` still hold their values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the new name is blank, `Error::NotFound`
    /// if there is no such equipment, `Error::InvalidState` if the record no
    /// longer matches `old`, or another error if the database operation fails.
    pub fn update_equipment(
        &self,
        id: EquipmentId,
        old: &EquipmentUpdate,
        new: &EquipmentUpdate,
    ) -> Result<Equipment, Error> {
        if new.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(Error::Validation("equipment name must not be empty".into()));
        }
        let table = self.equipment_map();
        with_transaction(self.states.db(), |txn| {
            let equipment = table
                .get_for_update(id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {id}")))?;
            if !old.verify(&equipment) {
                return Err(Error::InvalidState(format!("equipment {id} has changed")));
            }
            let updated = new.apply(equipment)?;
            table.put_with_transaction(&updated, txn)?;
            Ok(updated)
        })
    }

    /// Removes an equipment together with its readings, anomalies,
    /// recommendations and tickets, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such equipment, or another
    /// error if the database operation fails, in which case nothing is
    /// removed.
    pub fn remove_equipment(&self, id: EquipmentId) -> Result<Equipment, Error> {
        let equipments = self.equipment_map();
        let readings = self.sensor_data_map();
        let anomalies = self.anomaly_log_map();
        let recommendations = self.recommendation_map();
        let tickets = self.ticket_map();

        let (equipment, counts) = with_transaction(self.states.db(), |txn| {
            let equipment = equipments
                .get_for_update(id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {id}")))?;
            let counts = (
                readings.delete_by_equipment(id, txn)?,
                anomalies.delete_by_equipment(id, txn)?,
                recommendations.delete_by_equipment(id, txn)?,
                tickets.delete_by_equipment(id, txn)?,
            );
            equipments.delete_with_transaction(&equipment, txn)?;
            Ok::<_, Error>((equipment, counts))
        })?;
        tracing::info!(
            "removed equipment {id} with {} readings, {} anomalies, {} recommendations and {} tickets",
            counts.0,
            counts.1,
            counts.2,
            counts.3
        );
        Ok(equipment)
    }

    /// Returns an equipment together with its anomalies, recommendations and
    /// tickets.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such equipment, or another
    /// error if the database query fails.
    pub fn equipment_history(&self, id: EquipmentId) -> Result<EquipmentHistory, Error> {
        let equipment = self.equipment(id)?;
        Ok(EquipmentHistory {
            equipment,
            anomalies: self.anomaly_log_map().list_by_equipment(id, None)?,
            recommendations: self.recommendation_map().list_by_equipment(id)?,
            tickets: self.ticket_map().list_by_equipment(id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::{test, EquipmentStatus, EquipmentUpdate, Error};

    #[test]
    fn register_and_list() {
        let store = test::setup_store();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(matches!(
            store.register_equipment(" ", "pump", "", date, EquipmentStatus::Active),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.register_equipment("p-1", "", "", date, EquipmentStatus::Active),
            Err(Error::Validation(_))
        ));

        let a = test::register(&store, "pump");
        let b = store
            .register_equipment("m-1", "mill", "plant 1", date, EquipmentStatus::Down)
            .unwrap();
        assert!(a < b);

        let all = store.equipments().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].status(), EquipmentStatus::Down);
        assert_eq!(all[0].open_tickets(), 0);
        assert!(all[0].last_reading_time().is_none());
        assert!(matches!(store.equipment(b + 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn update_descriptive_fields() {
        let store = test::setup_store();
        let id = test::register(&store, "pump");

        let old = EquipmentUpdate {
            name: None,
            location: Some("plant 2".to_string()),
        };
        let new = EquipmentUpdate {
            name: Some("pump-a".to_string()),
            location: Some("plant 3".to_string()),
        };
        let updated = store.update_equipment(id, &old, &new).unwrap();
        assert_eq!(updated.name, "pump-a");
        assert_eq!(store.equipment(id).unwrap().location, "plant 3");
        assert_eq!(updated.status(), EquipmentStatus::Active);

        assert!(matches!(
            store.update_equipment(id, &old, &new),
            Err(Error::InvalidState(_))
        ));
        let blank = EquipmentUpdate {
            name: Some(String::new()),
            location: None,
        };
        assert!(matches!(
            store.update_equipment(id, &EquipmentUpdate::default(), &blank),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.update_equipment(id + 1, &EquipmentUpdate::default(), &new),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn removal_cascades() {
        let store = test::setup_store();
        test::pump_thresholds(&store);
        let pump = test::register(&store, "pump");
        let other = test::register(&store, "pump");

        for (id, minutes) in [(pump, 0), (other, 0), (pump, 1)] {
            let hot = crate::Measurement {
                process_temperature: 320.0,
                ..test::normal(minutes)
            };
            store.ingest(id, hot, &test::clock(minutes)).unwrap();
        }
        let recommendation = store.recommendations(pump).unwrap().remove(0);
        let ticket = store
            .create_ticket(pump, recommendation.id, "crew a", &test::clock(2))
            .unwrap();

        let history = store.equipment_history(pump).unwrap();
        assert_eq!(history.anomalies.len(), 2);
        assert_eq!(history.recommendations.len(), 2);
        assert_eq!(history.tickets.len(), 1);
        assert_eq!(history.equipment.status(), EquipmentStatus::Maintenance);

        let removed = store.remove_equipment(pump).unwrap();
        assert_eq!(removed.id, pump);
        assert!(matches!(store.equipment(pump), Err(Error::NotFound(_))));
        assert!(matches!(
            store.equipment_history(pump),
            Err(Error::NotFound(_))
        ));
        assert!(store.readings(pump, None).unwrap().is_empty());
        assert!(store.anomalies(pump, None).unwrap().is_empty());
        assert!(store.recommendations(pump).unwrap().is_empty());
        assert!(store.tickets(pump).unwrap().is_empty());
        for anomaly in &history.anomalies {
            assert!(store
                .recommendation_map()
                .get_by_anomaly(anomaly.id)
                .unwrap()
                .is_none());
        }
        assert!(matches!(store.ticket(ticket.id), Err(Error::NotFound(_))));

        assert_eq!(store.readings(other, None).unwrap().len(), 1);
        assert_eq!(store.anomalies(other, None).unwrap().len(), 1);
        assert_eq!(store.recommendations(other).unwrap().len(), 1);
        assert!(matches!(
            store.remove_equipment(pump),
            Err(Error::NotFound(_))
        ));
    }
}
