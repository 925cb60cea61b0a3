//! # Dead-Letter Sink
//!
//! Durable record of messages that could not be processed after their
//! retries ran out, kept per originating topic until an operator replays them.
//!
//! - [`DeadLetterSink::record`] is append-only; records are never overwritten.
//! - [`DeadLetterSink::list`] filters by topic and failure date range.
//! - [`replay`] re-publishes the original envelope (same `eventId`) to its
//!   original topic with its original partition key, then marks the record
//!   resolved. Replay is always operator-triggered.

mod inmemory;
mod postgres;

pub use inmemory::InMemoryDeadLetterSink;
pub use postgres::PgDeadLetterSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{headers, BusError, EventBus, EventEnvelope, PublishRecord};

/// Errors raised by dead-letter sinks and replay
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead letter {0} not found")]
    NotFound(Uuid),

    #[error("dead letter {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("replay publish failed: {0}")]
    Publish(#[from] BusError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The failed message as it was received
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterPayload {
    Envelope(EventEnvelope<serde_json::Value>),
    /// Bytes that never decoded into an envelope
    Raw(Vec<u8>),
}

impl DeadLetterPayload {
    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            DeadLetterPayload::Envelope(envelope) => Some(envelope.event_id),
            DeadLetterPayload::Raw(_) => None,
        }
    }

    /// Bytes to put back on the broker
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            DeadLetterPayload::Envelope(envelope) => envelope.to_bytes(),
            DeadLetterPayload::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// A dead letter as handed to [`DeadLetterSink::record`]
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub original_topic: String,
    /// Partition / ordering key the message was delivered under
    pub partition_key: String,
    /// Broker offset, stream sequence, or outbox sequence number
    pub original_offset: String,
    pub payload: DeadLetterPayload,
    pub error: String,
    /// Error source chain and dispatch details
    pub stack_context: String,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_count: i32,
}

/// A persisted dead letter
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_topic: String,
    pub partition_key: String,
    pub original_offset: String,
    pub payload: DeadLetterPayload,
    pub error: String,
    pub stack_context: String,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    pub(crate) fn from_new(id: Uuid, new: NewDeadLetter, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id,
            original_topic: new.original_topic,
            partition_key: new.partition_key,
            original_offset: new.original_offset,
            payload: new.payload,
            error: new.error,
            stack_context: new.stack_context,
            first_failed_at: new.first_failed_at,
            attempt_count: new.attempt_count,
            recorded_at,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Query for [`DeadLetterSink::list`]
///
/// Date bounds apply to `first_failed_at`: `from` inclusive, `to` exclusive.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub topic: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub include_resolved: bool,
    pub limit: Option<i64>,
}

impl DeadLetterFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn including_resolved(mut self) -> Self {
        self.include_resolved = true;
        self
    }

    pub(crate) fn matches(&self, record: &DeadLetterRecord) -> bool {
        if let Some(topic) = &self.topic {
            if &record.original_topic != topic {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.first_failed_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.first_failed_at >= to {
                return false;
            }
        }
        self.include_resolved || !record.is_resolved()
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a record; returns its id
    async fn record(&self, dead_letter: NewDeadLetter) -> Result<Uuid, DlqError>;

    /// Records matching `filter`, oldest failure first
    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, DlqError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DlqError>;

    /// Transition an unresolved record to resolved
    ///
    /// Fails with [`DlqError::AlreadyResolved`] if another replay won the race.
    async fn mark_resolved(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<(), DlqError>;
}

/// Outcome of a successful [`replay`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub record_id: Uuid,
    pub topic: String,
    /// `None` for raw payloads
    pub event_id: Option<Uuid>,
    pub resolved_at: DateTime<Utc>,
}

/// Re-publish a dead letter to its original topic and mark it resolved
///
/// The envelope keeps its original `eventId`: the message was never handled
/// successfully, so downstream idempotency records do not contain it. The
/// `replayedFrom` header marks the publish as a replay, which gives it a
/// broker de-dup id distinct from the original publish and lets consumers
/// tell it apart from a redelivered copy. If the publish fails the record is
/// left untouched.
pub async fn replay(
    sink: &dyn DeadLetterSink,
    bus: &dyn EventBus,
    record_id: Uuid,
) -> Result<ReplayOutcome, DlqError> {
    let record = sink
        .get(record_id)
        .await?
        .ok_or(DlqError::NotFound(record_id))?;

    if record.is_resolved() {
        return Err(DlqError::AlreadyResolved(record_id));
    }

    let bytes = record.payload.to_bytes()?;
    let mut publish = PublishRecord::new(&record.original_topic, &record.partition_key, bytes)
        .with_header(headers::REPLAYED_FROM, record.id.to_string());

    if let DeadLetterPayload::Envelope(envelope) = &record.payload {
        publish = publish
            .with_header(headers::TENANT_ID, &envelope.tenant_id)
            .with_header(headers::EVENT_TYPE, &envelope.event_type)
            .with_header(headers::CORRELATION_ID, &envelope.correlation_id)
            .with_header(headers::EVENT_ID, envelope.event_id.to_string());
    }

    bus.publish_record(publish).await?;

    let resolved_at = Utc::now();
    sink.mark_resolved(record_id, resolved_at).await?;

    tracing::info!(
        dead_letter_id = %record_id,
        topic = %record.original_topic,
        event_id = ?record.payload.event_id(),
        "Dead letter replayed and resolved"
    );

    Ok(ReplayOutcome {
        record_id,
        topic: record.original_topic,
        event_id: record.payload.event_id(),
        resolved_at,
    })
}
