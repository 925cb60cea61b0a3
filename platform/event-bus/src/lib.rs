//! # Event Bus
//!
//! The shared substrate that turns committed state changes into published
//! events and lets other services consume them under at-least-once delivery.
//!
//! ## Pieces
//!
//! - [`EventEnvelope`]: canonical wire format of every event
//! - [`outbox`]: transactional outbox (write path + relay work queue)
//! - [`relay`]: drains the outbox into the broker, keyed per aggregate
//! - [`dlq`]: dead-letter sink with operator replay
//! - [`EventBus`]: broker abstraction with two implementations
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus, NatsBus, PublishRecord};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS JetStream
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn EventBus> = Arc::new(NatsBus::new(nats_client));
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! // Publish keyed bytes with routing headers
//! let record = PublishRecord::new("trades.events", "T-42", b"{}".to_vec())
//!     .with_header("tenantId", "tenant-1");
//! bus.publish_record(record).await?;
//!
//! // Consume as a member of a consumer group
//! let mut deliveries = bus.consume("trades.events", "positions").await?;
//! while let Some(delivery) = futures::StreamExt::next(&mut deliveries).await {
//!     println!("{} bytes at offset {}", delivery.message.payload.len(), delivery.offset);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_bus;
mod nats_bus;

pub mod consumer_retry;
pub mod dlq;
pub mod outbox;
pub mod relay;

pub use envelope::{validate_envelope_fields, EntityRef, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Embedded migrations for the outbox and dead-letter tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./db/migrations");

/// Header names carried on every relay publish so consumers can route and
/// filter without decoding the envelope
pub mod headers {
    pub const TENANT_ID: &str = "tenantId";
    pub const EVENT_TYPE: &str = "eventType";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const EVENT_ID: &str = "eventId";
    pub const PARTITION_KEY: &str = "partitionKey";
    /// Set on re-published dead letters
    pub const REPLAYED_FROM: &str = "replayedFrom";
}

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }

    /// Ordering key of the message, falling back to the subject
    pub fn partition_key(&self) -> &str {
        self.header(headers::PARTITION_KEY)
            .unwrap_or(self.subject.as_str())
    }
}

/// A keyed publish request
///
/// All records sharing a `key` on one destination are delivered in publish order.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub subject: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl PublishRecord {
    pub fn new(subject: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        let key = key.into();
        let mut map = HashMap::new();
        map.insert(headers::PARTITION_KEY.to_string(), key.clone());
        Self {
            subject: subject.into(),
            key,
            payload,
            headers: map,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub(crate) fn into_message(self) -> BusMessage {
        BusMessage::new(self.subject, self.payload).with_headers(self.headers)
    }
}

/// Broker-side acknowledgement of one delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    /// Tell the broker the delivery is still being worked on, so it holds
    /// off redelivering it. Brokers without a redelivery timer ignore this.
    async fn in_progress(&self) -> BusResult<()> {
        Ok(())
    }
}

/// A message handed to a consumer group member
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// unacknowledged; the broker redelivers it.
pub struct Delivery {
    pub message: BusMessage,
    /// Ordering key the message was published with
    pub partition_key: String,
    /// Broker cursor of the message within its subject/stream
    pub offset: u64,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: BusMessage, offset: u64, acker: Arc<dyn Acknowledge>) -> Self {
        let partition_key = message.partition_key().to_string();
        Self {
            message,
            partition_key,
            offset,
            acker,
        }
    }

    /// Acknowledge the delivery, advancing the group's cursor past it
    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Extend the broker's redelivery deadline while a handler is running
    pub async fn in_progress(&self) -> BusResult<()> {
        self.acker.in_progress().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("partition_key", &self.partition_key)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction
///
/// Publishing is keyed: the broker keeps per-key order on a destination.
/// Consumption is group-based with explicit acknowledgement.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish unkeyed bytes to a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish one keyed record with headers
    ///
    /// Returns once the broker has accepted the record.
    async fn publish_record(&self, record: PublishRecord) -> BusResult<()>;

    /// Publish records in order, stopping at the first failure
    ///
    /// A failure part-way leaves the earlier records published; callers treat
    /// the whole batch as failed and re-publish it, so consumers see duplicates
    /// rather than gaps.
    async fn publish_batch(&self, records: Vec<PublishRecord>) -> BusResult<()> {
        for record in records {
            self.publish_record(record).await?;
        }
        Ok(())
    }

    /// Subscribe to messages matching a subject pattern (no acknowledgement)
    ///
    /// * `*` matches a single token (e.g., `trades.*.booked`)
    /// * `>` matches one or more tokens (e.g., `trades.>`)
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Consume a subject as a member of `group`
    ///
    /// Messages arrive in broker order and must be acknowledged individually.
    async fn consume(&self, subject: &str, group: &str)
        -> BusResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_record_carries_partition_key_header() {
        let record = PublishRecord::new("trades.events", "T-1", b"x".to_vec())
            .with_header(headers::TENANT_ID, "tenant-1");

        let msg = record.into_message();
        assert_eq!(msg.partition_key(), "T-1");
        assert_eq!(msg.header(headers::TENANT_ID), Some("tenant-1"));
    }

    #[test]
    fn test_partition_key_falls_back_to_subject() {
        let msg = BusMessage::new("trades.events".to_string(), vec![]);
        assert_eq!(msg.partition_key(), "trades.events");
    }
}
