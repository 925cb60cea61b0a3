//! # Transactional Outbox
//!
//! The outbox is the unit of atomicity between a domain write and the intent
//! to publish an event about it.
//!
//! ## Write path
//!
//! A service appends an entry with the same transaction handle it uses for its
//! domain rows ([`PgOutboxStore::append`], or
//! [`InMemoryOutboxTransaction::append`] in tests). The entry exists iff that
//! transaction commits. The store assigns `sequence_number` in write order;
//! entries appended in one transaction keep their relative order.
//!
//! ## Read path
//!
//! The relay treats the table as an ordered work queue ([`OutboxQueue`]):
//! [`OutboxQueue::claim_batch`] locks up to `limit` unprocessed, non-stalled
//! entries in `sequence_number` order, skipping rows another relay instance
//! holds. The claimed [`OutboxBatch`] carries the relay's status updates and
//! releases the locks on commit (or drop).
//!
//! Entries are never modified by anything but the relay.

mod inmemory;
mod postgres;

pub use inmemory::{InMemoryOutboxStore, InMemoryOutboxTransaction};
pub use postgres::PgOutboxStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{EntityRef, EventEnvelope};

/// Errors raised by outbox stores
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transaction already finished")]
    TransactionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// One row of the outbox table
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxEntry {
    /// Primary key; doubles as the envelope's `eventId`
    pub id: Uuid,
    /// Store-assigned write order
    pub sequence_number: i64,
    pub event_type: String,
    pub event_version: i32,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_sequence: i64,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Rebuild the envelope this entry was appended from
    pub fn envelope(&self) -> EventEnvelope<serde_json::Value> {
        EventEnvelope {
            event_id: self.id,
            event_type: self.event_type.clone(),
            event_version: u32::try_from(self.event_version).unwrap_or(1),
            occurred_at: self.occurred_at,
            producer: self.producer.clone(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            entity: EntityRef::new(
                self.entity_type.clone(),
                self.entity_id.clone(),
                self.entity_sequence,
            ),
            payload: self.payload.clone(),
        }
    }

    /// Stalled entries are no longer selected by the relay
    pub fn is_stalled(&self, max_retries: i32) -> bool {
        self.processed_at.is_none() && self.retry_count >= max_retries
    }
}

/// Column values for a new outbox row, taken from an envelope
#[derive(Debug, Clone)]
pub(crate) struct NewOutboxEntry {
    pub id: Uuid,
    pub event_type: String,
    pub event_version: i32,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_sequence: i64,
    pub payload: serde_json::Value,
}

impl NewOutboxEntry {
    pub(crate) fn from_envelope<T: Serialize>(
        envelope: &EventEnvelope<T>,
    ) -> Result<Self, OutboxError> {
        let event_version = i32::try_from(envelope.event_version).map_err(|_| {
            OutboxError::Internal(format!(
                "eventVersion {} out of range",
                envelope.event_version
            ))
        })?;

        Ok(Self {
            id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            event_version,
            occurred_at: envelope.occurred_at,
            producer: envelope.producer.clone(),
            tenant_id: envelope.tenant_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            causation_id: envelope.causation_id.clone(),
            entity_type: envelope.entity.entity_type.clone(),
            entity_id: envelope.entity.entity_id.clone(),
            entity_sequence: envelope.entity.sequence,
            payload: serde_json::to_value(&envelope.payload)?,
        })
    }
}

/// Entry state after a failed publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    pub id: Uuid,
    pub retry_count: i32,
}

/// Entries claimed by one relay cycle
///
/// Updates are staged inside the claim's transaction and only become visible
/// on [`OutboxBatch::commit`]. Dropping a batch without committing discards
/// them and releases the claimed rows.
#[async_trait]
pub trait OutboxBatch: Send {
    /// Claimed entries, in `sequence_number` order
    fn entries(&self) -> &[OutboxEntry];

    /// Set `processed_at` on the given entries
    async fn mark_processed(
        &mut self,
        ids: &[Uuid],
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    /// Increment `retry_count` and set `last_error`; returns the new counts
    async fn record_failure(
        &mut self,
        ids: &[Uuid],
        error: &str,
    ) -> Result<Vec<FailureUpdate>, OutboxError>;

    async fn commit(self: Box<Self>) -> Result<(), OutboxError>;
}

/// The relay's view of the outbox: an ordered, competing-consumer work queue
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Lock up to `limit` unprocessed entries with `retry_count < max_retries`,
    /// oldest `sequence_number` first, skipping rows locked by other claimants
    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError>;

    /// Unprocessed entries that exhausted their retries
    async fn stalled(&self, max_retries: i32) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Physically delete entries processed before `before`; returns the count
    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_mirrors_envelope() {
        let envelope = EventEnvelope::new(
            "trade.booked",
            "trade-capture",
            "tenant-1",
            EntityRef::new("trade", "T-1", 4),
            json!({"qty": 5}),
        )
        .with_event_version(2);

        let entry = NewOutboxEntry::from_envelope(&envelope).unwrap();

        assert_eq!(entry.id, envelope.event_id);
        assert_eq!(entry.event_version, 2);
        assert_eq!(entry.entity_id, "T-1");
        assert_eq!(entry.entity_sequence, 4);
        assert_eq!(entry.payload, json!({"qty": 5}));
    }

    #[test]
    fn test_stalled_requires_unprocessed_and_exhausted() {
        let now = Utc::now();
        let mut entry = OutboxEntry {
            id: Uuid::new_v4(),
            sequence_number: 1,
            event_type: "trade.booked".to_string(),
            event_version: 1,
            occurred_at: now,
            producer: "trade-capture".to_string(),
            tenant_id: "tenant-1".to_string(),
            correlation_id: "corr".to_string(),
            causation_id: None,
            entity_type: "trade".to_string(),
            entity_id: "T-1".to_string(),
            entity_sequence: 1,
            payload: json!({}),
            created_at: now,
            processed_at: None,
            retry_count: 5,
            last_error: Some("broker down".to_string()),
        };

        assert!(entry.is_stalled(5));
        assert!(!entry.is_stalled(6));

        entry.processed_at = Some(now);
        assert!(!entry.is_stalled(5));

        let envelope = entry.envelope();
        assert_eq!(envelope.event_id, entry.id);
        assert_eq!(envelope.entity.sequence, 1);
    }
}
