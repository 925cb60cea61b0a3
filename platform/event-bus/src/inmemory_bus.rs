//! In-memory implementation of the EventBus trait for testing and development

use crate::{Acknowledge, BusError, BusMessage, BusResult, Delivery, EventBus, PublishRecord};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// A message together with the offset it was assigned on its subject
#[derive(Debug, Clone)]
struct Published {
    offset: u64,
    message: BusMessage,
}

#[derive(Default)]
struct BusState {
    /// Next offset per subject
    offsets: HashMap<String, u64>,
    /// Acknowledged (subject, offset) pairs per consumer group
    acks: HashMap<String, Vec<(String, u64)>>,
    /// In-progress signals per consumer group, in arrival order
    progress: HashMap<String, Vec<(String, u64)>>,
}

/// EventBus implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// Messages are broadcast to every subscriber and every consumer stream whose
/// pattern matches; group membership does not split the traffic. Each subject
/// assigns increasing offsets in publish order, and acknowledgements are
/// recorded per group so tests can assert on commit behaviour.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// // Publish a message
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// // Receive it
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<Published>>,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    ///
    /// The bus uses a broadcast channel with a buffer of 1000 messages.
    /// If this buffer is exceeded, the oldest messages will be dropped.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size
    ///
    /// # Arguments
    /// * `buffer_size` - The maximum number of messages to buffer before dropping old ones
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Acknowledged `(subject, offset)` pairs for a consumer group, in ack order
    pub fn acknowledged(&self, group: &str) -> Vec<(String, u64)> {
        self.state
            .lock()
            .map(|s| s.acks.get(group).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// In-progress signals `(subject, offset)` sent by a consumer group
    pub fn in_progress_signals(&self, group: &str) -> Vec<(String, u64)> {
        self.state
            .lock()
            .map(|s| s.progress.get(group).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    ///
    /// # Examples
    /// - `trades.events.>` matches `trades.events.booked.v1`
    /// - `trades.*.booked` matches `trades.events.booked`
    /// - `trades.events.*` does NOT match `trades.events.booked.v1` (too many tokens)
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    fn send(&self, message: BusMessage) -> BusResult<()> {
        // Offset assignment and broadcast happen under one lock so offsets
        // follow send order.
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::InternalError("in-memory bus state poisoned".to_string()))?;

        let next = state.offsets.entry(message.subject.clone()).or_insert(0);
        *next += 1;
        let offset = *next;

        // No receivers is fine
        let _ = self.sender.send(Published { offset, message });

        Ok(())
    }

    fn matching(&self, pattern: &str) -> BoxStream<'static, Published> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(published) => {
                        if Self::matches_pattern(&published.message.subject, &pattern) {
                            yield published;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        stream.boxed()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryAck {
    state: Arc<Mutex<BusState>>,
    group: String,
    subject: String,
    offset: u64,
}

#[async_trait]
impl Acknowledge for InMemoryAck {
    async fn ack(&self) -> BusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::AckError("in-memory bus state poisoned".to_string()))?;
        state
            .acks
            .entry(self.group.clone())
            .or_default()
            .push((self.subject.clone(), self.offset));
        Ok(())
    }

    async fn in_progress(&self) -> BusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::AckError("in-memory bus state poisoned".to_string()))?;
        state
            .progress
            .entry(self.group.clone())
            .or_default()
            .push((self.subject.clone(), self.offset));
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.send(BusMessage::new(subject.to_string(), payload))
    }

    async fn publish_record(&self, record: PublishRecord) -> BusResult<()> {
        self.send(record.into_message())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        Ok(self.matching(pattern).map(|p| p.message).boxed())
    }

    async fn consume(
        &self,
        pattern: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let state = self.state.clone();
        let group = group.to_string();

        let stream = self.matching(pattern).map(move |published| {
            let acker = Arc::new(InMemoryAck {
                state: state.clone(),
                group: group.clone(),
                subject: published.message.subject.clone(),
                offset: published.offset,
            });
            Delivery::new(published.message, published.offset, acker)
        });

        Ok(stream.boxed())
    }
}
