//! The `maintenance_tickets` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Direction, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

use super::UniqueKey;
use crate::{
    collections::Map,
    types::{EquipmentId, FromKeyValue, RecommendationId, TicketId, TicketStatus},
};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ticket {
    pub id: TicketId,
    pub equipment_id: EquipmentId,
    pub recommendation_id: RecommendationId,
    status: TicketStatus,
    pub assigned_team: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub(crate) fn new(
        id: TicketId,
        equipment_id: EquipmentId,
        recommendation_id: RecommendationId,
        assigned_team: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            equipment_id,
            recommendation_id,
            status: TicketStatus::Open,
            assigned_team,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn status(&self) -> TicketStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TicketStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

impl Ticket {
    pub(crate) fn key(equipment_id: EquipmentId, id: TicketId) -> [u8; 8] {
        let mut key = [0; 8];
        key[..4].copy_from_slice(&equipment_id.to_be_bytes());
        key[4..].copy_from_slice(&id.to_be_bytes());
        key
    }
}

impl FromKeyValue for Ticket {
    fn from_key_value(_key: &[u8], value: &[u8]) -> Result<Self> {
        super::deserialize(value)
    }
}

impl UniqueKey for Ticket {
    fn unique_key(&self) -> Vec<u8> {
        Self::key(self.equipment_id, self.id).to_vec()
    }
}

/// Tickets keyed by equipment, together with the index that finds a ticket
/// by its ID alone.
pub struct Table<'d> {
    tickets: Map<'d>,
    by_id: Map<'d>,
}

impl<'d> Table<'d> {
    /// Opens the ticket tables in the database.
    ///
    /// Returns `None` if either table does not exist.
    pub(super) fn open(db: &'d OptimisticTransactionDB) -> Option<Self> {
        let tickets = Map::open(db, super::MAINTENANCE_TICKETS)?;
        let by_id = Map::open(db, super::MAINTENANCE_TICKET_IDS)?;
        Some(Self { tickets, by_id })
    }

    /// Returns the ticket with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or the index is corrupt.
    pub fn get(&self, id: TicketId) -> Result<Option<Ticket>> {
        let Some(key) = self.by_id.get(&id.to_be_bytes())? else {
            return Ok(None);
        };
        let value = self
            .tickets
            .get(&key)?
            .context("ticket index points to a missing entry")?;
        Ticket::from_key_value(&key, &value).map(Some)
    }

    pub(crate) fn get_for_update(
        &self,
        id: TicketId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<Option<Ticket>> {
        let Some(key) = self.by_id.get_for_update(&id.to_be_bytes(), txn)? else {
            return Ok(None);
        };
        let value = self
            .tickets
            .get_for_update(&key, txn)?
            .context("ticket index points to a missing entry")?;
        Ticket::from_key_value(&key, &value).map(Some)
    }

    /// Stores a new ticket and its index entry in `txn`.
    pub(crate) fn insert_with_transaction(
        &self,
        ticket: &Ticket,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        let key = ticket.unique_key();
        self.by_id
            .insert_with_transaction(&ticket.id.to_be_bytes(), &key, txn)?;
        self.tickets
            .insert_with_transaction(&key, &super::serialize(ticket)?, txn)
    }

    /// Overwrites a stored ticket in `txn`.
    pub(crate) fn put_with_transaction(
        &self,
        ticket: &Ticket,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        self.tickets
            .put_with_transaction(&ticket.unique_key(), &super::serialize(ticket)?, txn)
    }

    /// Returns the tickets of an equipment in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a record is invalid.
    pub fn list_by_equipment(&self, equipment_id: EquipmentId) -> Result<Vec<Ticket>> {
        self.tickets
            .inner_prefix_iterator(Direction::Forward, None, &equipment_id.to_be_bytes())
            .map(|item| {
                let (key, value) = item?;
                Ticket::from_key_value(&key, &value)
            })
            .collect()
    }

    /// Deletes every ticket of an equipment and their index entries in `txn`.
    pub(crate) fn delete_by_equipment(
        &self,
        equipment_id: EquipmentId,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<usize> {
        let tickets = self.list_by_equipment(equipment_id)?;
        for ticket in &tickets {
            self.by_id
                .delete_with_transaction(&ticket.id.to_be_bytes(), txn)?;
            self.tickets
                .delete_with_transaction(&ticket.unique_key(), txn)?;
        }
        Ok(tickets.len())
    }
}
