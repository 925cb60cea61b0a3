//! Per-message dispatch state machine
//!
//! ```text
//! RECEIVED ──decode/validate──▶ DESERIALIZED ──▶ CONTEXT_RESTORED ──lookup──▶ DISPATCHED
//!    │ fails                                          │ no handler           │
//!    ▼                                                ▼                      ├─ ok ─────▶ HANDLED
//! UNPARSEABLE (counted, never retried)            acked, dropped         └─ retries ─▶ FAILED ─▶ dead letter
//! ```
//!
//! A broker redelivery of an event this router already dead-lettered is
//! acknowledged without running the handler again, so one failing event
//! yields one dead-letter record. Operator replays carry `replayedFrom` and
//! are always handled.
//!
//! The router never acknowledges; the runtime decides from the returned
//! [`DispatchOutcome`] and its commit strategy.

use chrono::{DateTime, Utc};
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::dlq::{DeadLetterPayload, DeadLetterSink, NewDeadLetter};
use event_bus::{headers, validate_envelope_fields, BusMessage, EventEnvelope};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{DeliveryInfo, EventContext};
use crate::metrics::ConsumerMetrics;
use crate::registry::{HandlerError, HandlerRegistry};

/// Terminal state of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { attempts: u32 },
    /// No handler for the event type; acknowledged and dropped
    NoHandler,
    /// Not a valid envelope; counted and skipped
    Unparseable { reason: String },
    DeadLettered { record_id: Uuid, attempts: u32 },
    /// Redelivered copy of an event already dead-lettered; acknowledged
    AlreadyDeadLettered { record_id: Uuid },
    /// The sink could not persist the failure; leave the delivery unacked
    DeadLetterFailed { error: String },
}

impl DispatchOutcome {
    /// Whether a manual-commit runtime may acknowledge the delivery
    pub fn should_ack(&self) -> bool {
        !matches!(self, DispatchOutcome::DeadLetterFailed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled { .. } => "handled",
            DispatchOutcome::NoHandler => "no_handler",
            DispatchOutcome::Unparseable { .. } => "unparseable",
            DispatchOutcome::DeadLettered { .. } => "dead_lettered",
            DispatchOutcome::AlreadyDeadLettered { .. } => "already_dead_lettered",
            DispatchOutcome::DeadLetterFailed { .. } => "dead_letter_failed",
        }
    }
}

/// Dead-lettered events remembered for redelivery checks
const RECENT_DEAD_LETTERS: usize = 4096;

/// Bounded `(topic, eventId) → record id` map, oldest evicted first
struct RecentDeadLetters {
    order: VecDeque<(String, Uuid)>,
    records: HashMap<(String, Uuid), Uuid>,
}

impl RecentDeadLetters {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    fn get(&self, topic: &str, event_id: Uuid) -> Option<Uuid> {
        self.records.get(&(topic.to_string(), event_id)).copied()
    }

    fn insert(&mut self, topic: &str, event_id: Uuid, record_id: Uuid) {
        let key = (topic.to_string(), event_id);
        if self.records.insert(key.clone(), record_id).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > RECENT_DEAD_LETTERS {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }
}

pub struct Router {
    registry: Arc<HandlerRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    consumer_group: String,
    retry: RetryConfig,
    handler_timeout: Duration,
    metrics: ConsumerMetrics,
    recent_dead_letters: Mutex<RecentDeadLetters>,
}

impl Router {
    pub fn new(
        registry: HandlerRegistry,
        dead_letters: Arc<dyn DeadLetterSink>,
        consumer_group: impl Into<String>,
        metrics: ConsumerMetrics,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            dead_letters,
            consumer_group: consumer_group.into(),
            retry: RetryConfig::default(),
            handler_timeout: Duration::from_secs(30),
            metrics,
            recent_dead_letters: Mutex::new(RecentDeadLetters::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    /// Run one message through decode, context restoration, lookup, handling
    /// with bounded retry, and dead-lettering
    pub async fn dispatch(&self, message: &BusMessage, delivery: &DeliveryInfo) -> DispatchOutcome {
        let envelope = match decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(reason) => {
                self.metrics
                    .unparseable_total
                    .with_label_values(&[delivery.topic.as_str()])
                    .inc();
                warn!(
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    partition_key = %delivery.partition_key,
                    error = %reason,
                    "Skipping unparseable message"
                );
                return self.finish(DispatchOutcome::Unparseable { reason });
            }
        };

        let span = info_span!(
            "handle_event",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            tenant_id = %envelope.tenant_id,
            correlation_id = %envelope.correlation_id,
            topic = %delivery.topic,
            offset = delivery.offset
        );

        let replayed = message.header(headers::REPLAYED_FROM).is_some();
        let outcome = self
            .handle(envelope, delivery, replayed)
            .instrument(span)
            .await;
        self.finish(outcome)
    }

    async fn handle(
        &self,
        envelope: EventEnvelope<Value>,
        delivery: &DeliveryInfo,
        replayed: bool,
    ) -> DispatchOutcome {
        let Some(registration) = self.registry.get(&envelope.event_type) else {
            debug!("No handler registered for event type, acknowledging");
            return DispatchOutcome::NoHandler;
        };

        if !replayed {
            if let Some(record_id) = self.recent_dead_letter(&delivery.topic, envelope.event_id) {
                warn!(
                    dead_letter_id = %record_id,
                    "Redelivered copy of a dead-lettered event, acknowledging"
                );
                return DispatchOutcome::AlreadyDeadLettered { record_id };
            }
        }

        let timeout = registration.timeout.unwrap_or(self.handler_timeout);
        let handler = &registration.handler;
        let first_failed_at: OnceLock<DateTime<Utc>> = OnceLock::new();
        let started = Instant::now();

        let envelope_ref = &envelope;
        let first_failed = &first_failed_at;
        let group = self.consumer_group.as_str();

        let outcome = retry_with_backoff(
            |attempt| {
                let ctx = EventContext::restore(envelope_ref, delivery, group, attempt);
                async move {
                    let result = match tokio::time::timeout(timeout, handler.handle(&ctx, envelope_ref))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::Timeout(timeout)),
                    };
                    if result.is_err() {
                        first_failed.get_or_init(Utc::now);
                    }
                    result
                }
            },
            &self.retry,
            &envelope.event_type,
            HandlerError::is_retryable,
        )
        .await;

        self.metrics
            .handler_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let err = match outcome.result {
            Ok(()) => {
                debug!(attempts = outcome.attempts, "Event handled");
                return DispatchOutcome::Handled {
                    attempts: outcome.attempts,
                };
            }
            Err(err) => err,
        };

        let dead_letter = NewDeadLetter {
            original_topic: delivery.topic.clone(),
            partition_key: delivery.partition_key.clone(),
            original_offset: delivery.offset.to_string(),
            stack_context: stack_context(&err, &envelope.event_type, group, outcome.attempts),
            error: err.to_string(),
            first_failed_at: first_failed_at.get().copied().unwrap_or_else(Utc::now),
            attempt_count: i32::try_from(outcome.attempts).unwrap_or(i32::MAX),
            payload: DeadLetterPayload::Envelope(envelope.clone()),
        };

        match self.dead_letters.record(dead_letter).await {
            Ok(record_id) => {
                if let Ok(mut recent) = self.recent_dead_letters.lock() {
                    recent.insert(&delivery.topic, envelope.event_id, record_id);
                }
                self.metrics
                    .dead_lettered_total
                    .with_label_values(&[envelope.event_type.as_str()])
                    .inc();
                error!(
                    dead_letter_id = %record_id,
                    attempts = outcome.attempts,
                    error = %err,
                    "Handler failed, message dead-lettered"
                );
                DispatchOutcome::DeadLettered {
                    record_id,
                    attempts: outcome.attempts,
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    handler_error = %err,
                    "Failed to record dead letter, leaving message for redelivery"
                );
                DispatchOutcome::DeadLetterFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn recent_dead_letter(&self, topic: &str, event_id: Uuid) -> Option<Uuid> {
        self.recent_dead_letters
            .lock()
            .ok()
            .and_then(|recent| recent.get(topic, event_id))
    }

    fn finish(&self, outcome: DispatchOutcome) -> DispatchOutcome {
        self.metrics
            .messages_total
            .with_label_values(&[outcome.label()])
            .inc();
        outcome
    }
}

fn decode(payload: &[u8]) -> Result<EventEnvelope<Value>, String> {
    let envelope: EventEnvelope<Value> =
        serde_json::from_slice(payload).map_err(|e| format!("invalid envelope: {}", e))?;
    validate_envelope_fields(&envelope)?;
    Ok(envelope)
}

fn stack_context(err: &HandlerError, event_type: &str, group: &str, attempts: u32) -> String {
    let mut lines = vec![format!(
        "consumer_group={} event_type={} attempts={}",
        group, event_type, attempts
    )];

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    let mut depth = 0;
    while let Some(e) = source {
        lines.push(format!("{}: {}", depth, e));
        source = e.source();
        depth += 1;
    }

    lines.join("\n")
}
