//! Maintenance ticket lifecycle.

use crate::{
    clock::Clock, collections::with_transaction, tables::TICKET_SEQUENCE, EquipmentId, Error,
    RecommendationId, Store, Ticket, TicketId, TicketStatus,
};

impl Store {
    /// Opens a ticket for carrying out a recommendation.
    ///
    /// The equipment counts the ticket as open and, if it was active, goes
    /// under maintenance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `team` is blank, `Error::NotFound` if the
    /// equipment or the recommendation for it is not stored, or another error
    /// if the database operation fails.
    pub fn create_ticket<C: Clock>(
        &self,
        equipment_id: EquipmentId,
        recommendation_id: RecommendationId,
        team: &str,
        clock: &C,
    ) -> Result<Ticket, Error> {
        if team.trim().is_empty() {
            return Err(Error::Validation("assigned team must not be empty".into()));
        }
        // Recommendations are only removed together with their equipment,
        // which the transaction below locks.
        self.recommendation(equipment_id, recommendation_id)?;

        let now = clock.now();
        let sequence = self.states.sequence(TICKET_SEQUENCE);
        let equipments = self.equipment_map();
        let tickets = self.ticket_map();
        let ticket = with_transaction(self.states.db(), |txn| {
            let mut equipment = equipments
                .get_for_update(equipment_id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {equipment_id}")))?;
            let id = sequence.next(txn)?;
            let ticket = Ticket::new(id, equipment_id, recommendation_id, team.to_string(), now);
            tickets.insert_with_transaction(&ticket, txn)?;
            equipment.claim_ticket();
            equipments.put_with_transaction(&equipment, txn)?;
            Ok::<_, Error>(ticket)
        })?;
        tracing::info!(
            "ticket {} opened for recommendation {recommendation_id} on equipment {equipment_id}",
            ticket.id
        );
        Ok(ticket)
    }

    /// Moves a ticket to `status`.
    ///
    /// Once the last open ticket of an equipment under maintenance is resolved
    /// or cancelled, the equipment becomes active again.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such ticket,
    /// `Error::InvalidTransition` if the ticket cannot move to `status`, or
    /// another error if the database operation fails. The ticket is unchanged
    /// on error.
    pub fn transition_ticket<C: Clock>(
        &self,
        id: TicketId,
        status: TicketStatus,
        clock: &C,
    ) -> Result<Ticket, Error> {
        let now = clock.now();
        let equipments = self.equipment_map();
        let tickets = self.ticket_map();
        let (ticket, from) = with_transaction(self.states.db(), |txn| {
            let mut ticket = tickets
                .get_for_update(id, txn)?
                .ok_or_else(|| Error::NotFound(format!("ticket {id}")))?;
            let from = ticket.status();
            if !from.can_transition_to(status) {
                return Err(Error::InvalidTransition { from, to: status });
            }
            let mut equipment = equipments
                .get_for_update(ticket.equipment_id, txn)?
                .ok_or_else(|| Error::NotFound(format!("equipment {}", ticket.equipment_id)))?;

            ticket.set_status(status, now);
            tickets.put_with_transaction(&ticket, txn)?;
            if from.is_open() && !status.is_open() {
                equipment.release_ticket();
            }
            equipments.put_with_transaction(&equipment, txn)?;
            Ok((ticket, from))
        })?;
        tracing::info!("ticket {id}: {from} -> {status}");
        Ok(ticket)
    }

    /// Returns the ticket with the given ID.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if there is no such ticket.
    pub fn ticket(&self, id: TicketId) -> Result<Ticket, Error> {
        self.ticket_map()
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))
    }

    /// Returns the tickets of an equipment in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn tickets(&self, equipment_id: EquipmentId) -> Result<Vec<Ticket>, Error> {
        Ok(self.ticket_map().list_by_equipment(equipment_id)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::{test, EquipmentStatus, Error, Measurement, RecommendationId, TicketStatus};

    /// Registers a pump with one hot reading and returns its ID and the
    /// recommendation generated for it.
    fn pump_with_recommendation(store: &crate::Store) -> (u32, RecommendationId) {
        test::pump_thresholds(store);
        let id = test::register(store, "pump");
        let reading = Measurement {
            process_temperature: 320.0,
            ..test::normal(0)
        };
        store.ingest(id, reading, &test::clock(0)).unwrap();
        let recommendation = store.recommendations(id).unwrap().remove(0);
        (id, recommendation.id)
    }

    #[test]
    fn resolve_restores_active() {
        let store = test::setup_store();
        let (id, recommendation) = pump_with_recommendation(&store);

        let ticket = store
            .create_ticket(id, recommendation, "line crew", &test::clock(1))
            .unwrap();
        assert_eq!(ticket.status(), TicketStatus::Open);
        assert_eq!(ticket.created_at, test::at(1));
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.status(), EquipmentStatus::Maintenance);
        assert_eq!(equipment.open_tickets(), 1);

        let ticket = store
            .transition_ticket(ticket.id, TicketStatus::InProgress, &test::clock(2))
            .unwrap();
        assert_eq!(ticket.status(), TicketStatus::InProgress);
        assert_eq!(ticket.updated_at, test::at(2));
        assert_eq!(store.equipment(id).unwrap().status(), EquipmentStatus::Maintenance);

        let ticket = store
            .transition_ticket(ticket.id, TicketStatus::Resolved, &test::clock(3))
            .unwrap();
        assert_eq!(ticket.created_at, test::at(1));
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.status(), EquipmentStatus::Active);
        assert_eq!(equipment.open_tickets(), 0);
    }

    #[test]
    fn invalid_transitions_leave_ticket_unchanged() {
        let store = test::setup_store();
        let (id, recommendation) = pump_with_recommendation(&store);
        let ticket = store
            .create_ticket(id, recommendation, "line crew", &test::clock(1))
            .unwrap();

        let err = store
            .transition_ticket(ticket.id, TicketStatus::Resolved, &test::clock(2))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TicketStatus::Open,
                to: TicketStatus::Resolved
            }
        ));
        assert_eq!(store.ticket(ticket.id).unwrap(), ticket);

        store
            .transition_ticket(ticket.id, TicketStatus::Cancelled, &test::clock(3))
            .unwrap();
        for to in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
            TicketStatus::Cancelled,
        ] {
            assert!(matches!(
                store.transition_ticket(ticket.id, to, &test::clock(4)),
                Err(Error::InvalidTransition { .. })
            ));
        }
        assert_eq!(store.ticket(ticket.id).unwrap().updated_at, test::at(3));
        assert!(matches!(
            store.transition_ticket(ticket.id + 1, TicketStatus::Cancelled, &test::clock(4)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn open_ticket_counting() {
        let store = test::setup_store();
        let (id, recommendation) = pump_with_recommendation(&store);
        let first = store
            .create_ticket(id, recommendation, "crew a", &test::clock(1))
            .unwrap();
        let second = store
            .create_ticket(id, recommendation, "crew b", &test::clock(1))
            .unwrap();
        assert_eq!(store.equipment(id).unwrap().open_tickets(), 2);

        store
            .transition_ticket(first.id, TicketStatus::InProgress, &test::clock(2))
            .unwrap();
        store
            .transition_ticket(first.id, TicketStatus::Resolved, &test::clock(3))
            .unwrap();
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.status(), EquipmentStatus::Maintenance);
        assert_eq!(equipment.open_tickets(), 1);

        store
            .transition_ticket(second.id, TicketStatus::Cancelled, &test::clock(4))
            .unwrap();
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.status(), EquipmentStatus::Active);
        assert_eq!(equipment.open_tickets(), 0);

        let ids: Vec<_> = store.tickets(id).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, [first.id, second.id]);
    }

    #[test]
    fn create_checks() {
        let store = test::setup_store();
        let (id, recommendation) = pump_with_recommendation(&store);
        assert!(matches!(
            store.create_ticket(id, recommendation, "  ", &test::clock(1)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.create_ticket(id, recommendation + 1, "crew", &test::clock(1)),
            Err(Error::NotFound(_))
        ));
        let other = test::register(&store, "pump");
        assert!(matches!(
            store.create_ticket(other, recommendation, "crew", &test::clock(1)),
            Err(Error::NotFound(_))
        ));
        assert!(store.tickets(id).unwrap().is_empty());
        assert_eq!(store.equipment(id).unwrap().open_tickets(), 0);
    }

    #[test]
    fn concurrent_tickets_keep_count() {
        const CREWS: usize = 8;
        let store = test::setup_store();
        let (id, recommendation) = pump_with_recommendation(&store);

        let tickets: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..CREWS)
                .map(|crew| {
                    let store = &store;
                    s.spawn(move || {
                        let team = format!("crew {crew}");
                        store
                            .create_ticket(id, recommendation, &team, &test::clock(1))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.open_tickets(), u32::try_from(CREWS).unwrap());
        assert_eq!(equipment.status(), EquipmentStatus::Maintenance);
        assert_eq!(store.tickets(id).unwrap().len(), CREWS);

        std::thread::scope(|s| {
            for ticket in &tickets {
                let store = &store;
                s.spawn(move || {
                    store
                        .transition_ticket(ticket.id, TicketStatus::Cancelled, &test::clock(2))
                        .unwrap();
                });
            }
        });
        let equipment = store.equipment(id).unwrap();
        assert_eq!(equipment.open_tickets(), 0);
        assert_eq!(equipment.status(), EquipmentStatus::Active);
    }
}
