//! # Event Envelope
//!
//! Platform-wide event envelope for everything that crosses a service boundary
//! through the outbox and the broker.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "eventId": "…", "eventType": "trade.booked", "eventVersion": 1,
//!   "occurredAt": "2026-01-01T00:00:00Z", "producer": "trade-capture",
//!   "tenantId": "t-1", "correlationId": "…", "causationId": "…",
//!   "entity": { "entityType": "trade", "entityId": "T-42", "sequence": 7 },
//!   "payload": { … }
//! }
//! ```
//!
//! ## Construction Rules
//!
//! - `eventId` is minted once in [`EventEnvelope::new`] and travels unchanged
//!   through every retry and redelivery; it is the de-duplication key.
//! - A root event (no parent) uses its own `eventId` as `correlationId`.
//! - [`EventEnvelope::caused_by`] starts a follow-up event: same tenant, same
//!   correlation, `causationId` set to the parent's `eventId`.
//! - `entity.sequence` is owned by the producing aggregate and must strictly
//!   increase per `entityId`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to the aggregate an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    /// Partition/ordering key for the broker
    pub entity_id: String,
    /// Strictly increasing per `entity_id`
    pub sequence: i64,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, sequence: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            sequence,
        }
    }
}

/// Standard event envelope
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type. Consumers that dispatch by
///   `event_type` work with `EventEnvelope<serde_json::Value>`.
///
/// # Examples
///
/// ```rust
/// use event_bus::{EntityRef, EventEnvelope};
/// use serde_json::json;
///
/// let booked = EventEnvelope::new(
///     "trade.booked",
///     "trade-capture",
///     "tenant-123",
///     EntityRef::new("trade", "T-42", 1),
///     json!({ "quantity": 100 }),
/// );
///
/// let settled = EventEnvelope::caused_by(
///     &booked,
///     "settlement.instructed",
///     "settlement",
///     EntityRef::new("settlement", "S-9", 1),
///     json!({}),
/// );
/// assert_eq!(settled.correlation_id, booked.correlation_id);
/// assert_eq!(settled.causation_id, Some(booked.event_id.to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Discriminator used for routing and handler dispatch
    pub event_type: String,

    /// Schema generation of the payload for this `event_type`
    pub event_version: u32,

    /// When the event happened in the producing service
    pub occurred_at: DateTime<Utc>,

    /// Service that produced the event
    pub producer: String,

    /// Tenant identifier for multi-tenant isolation
    pub tenant_id: String,

    /// Links every event/command of one causal chain
    pub correlation_id: String,

    /// Id of the event or command that produced this one; `null` on root events
    #[serde(default)]
    pub causation_id: Option<String>,

    pub entity: EntityRef,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a root envelope with a fresh event_id
    ///
    /// The correlation id of a root event is its own event id.
    pub fn new(
        event_type: impl Into<String>,
        producer: impl Into<String>,
        tenant_id: impl Into<String>,
        entity: EntityRef,
        payload: T,
    ) -> Self {
        Self::with_event_id(Uuid::new_v4(), event_type, producer, tenant_id, entity, payload)
    }

    /// Create an envelope with an explicit event_id (useful for testing)
    pub fn with_event_id(
        event_id: Uuid,
        event_type: impl Into<String>,
        producer: impl Into<String>,
        tenant_id: impl Into<String>,
        entity: EntityRef,
        payload: T,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            event_version: 1,
            occurred_at: Utc::now(),
            producer: producer.into(),
            tenant_id: tenant_id.into(),
            correlation_id: event_id.to_string(),
            causation_id: None,
            entity,
            payload,
        }
    }

    /// Create a follow-up envelope in the causal chain of `parent`
    pub fn caused_by<P>(
        parent: &EventEnvelope<P>,
        event_type: impl Into<String>,
        producer: impl Into<String>,
        entity: EntityRef,
        payload: T,
    ) -> Self {
        Self::new(event_type, producer, parent.tenant_id.clone(), entity, payload)
            .with_correlation_id(parent.correlation_id.clone())
            .with_causation_id(Some(parent.event_id.to_string()))
    }

    pub fn with_event_version(mut self, version: u32) -> Self {
        self.event_version = version;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Ordering key used by the relay when publishing
    pub fn partition_key(&self) -> &str {
        &self.entity.entity_id
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Convert the payload into an untyped JSON value
    pub fn into_untyped(self) -> Result<EventEnvelope<serde_json::Value>, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            producer: self.producer,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            entity: self.entity,
            payload,
        })
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Decode the JSON payload into `P`, keeping every envelope field
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<EventEnvelope<P>, serde_json::Error> {
        let payload = P::deserialize(&self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            producer: self.producer.clone(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            entity: self.entity.clone(),
            payload,
        })
    }
}

/// Validate the envelope-level fields of a decoded envelope
///
/// Payload shape is not checked here; that belongs to the schema owner of each
/// `event_type`.
///
/// # Validation Rules
///
/// - `eventType`, `producer`, `tenantId`, `correlationId`: non-empty
/// - `eventVersion`: at least 1
/// - `entity.entityType`, `entity.entityId`: non-empty
/// - `entity.sequence`: non-negative
pub fn validate_envelope_fields<T>(envelope: &EventEnvelope<T>) -> Result<(), String> {
    if envelope.event_type.trim().is_empty() {
        return Err("eventType cannot be empty".to_string());
    }
    if envelope.event_version == 0 {
        return Err("eventVersion must be at least 1".to_string());
    }
    if envelope.producer.trim().is_empty() {
        return Err("producer cannot be empty".to_string());
    }
    if envelope.tenant_id.trim().is_empty() {
        return Err("tenantId cannot be empty".to_string());
    }
    if envelope.correlation_id.trim().is_empty() {
        return Err("correlationId cannot be empty".to_string());
    }
    if envelope.entity.entity_type.trim().is_empty() {
        return Err("entity.entityType cannot be empty".to_string());
    }
    if envelope.entity.entity_id.trim().is_empty() {
        return Err("entity.entityId cannot be empty".to_string());
    }
    if envelope.entity.sequence < 0 {
        return Err(format!(
            "entity.sequence must be non-negative, got {}",
            envelope.entity.sequence
        ));
    }

    Ok(())
}
