//! NATS-based implementation of the EventBus trait

use crate::{
    headers, Acknowledge, BusError, BusMessage, BusResult, Delivery, EventBus, PublishRecord,
};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Header JetStream uses for publish-side de-duplication
const NATS_MSG_ID: &str = "Nats-Msg-Id";

/// Redelivery deadline for unacknowledged deliveries on durable consumers
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// EventBus implementation using NATS JetStream
///
/// Publishes wait for the JetStream publish ack, so a returned `Ok` means the
/// stream has persisted the message. Records carrying an `eventId` header also
/// set `Nats-Msg-Id`, letting the stream drop relay re-publishes inside its
/// duplicate window. Dead-letter replays get their own id (`eventId`,
/// `:replay:` and the record id) so the stream never drops a replay as a copy
/// of the original publish.
///
/// Group consumption uses durable pull consumers with explicit ack. Streams
/// are provisioned outside this crate; `consume` looks up the stream that owns
/// the subject. A delivery left unacknowledged for `ack_wait` is redelivered,
/// so consumers whose handling can run longer send
/// [`Delivery::in_progress`] while they work.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.publish("my.subject", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    ack_wait: Duration,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }

    /// Redelivery deadline for durable consumers created by [`EventBus::consume`]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Durable consumer names may not contain subject tokens or wildcards
    fn durable_name(group: &str, subject: &str) -> String {
        format!("{group}-{subject}")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }
        if let Some(msg_id) = Self::message_id(headers) {
            map.insert(NATS_MSG_ID, msg_id.as_str());
        }
        map
    }

    /// De-dup id for a record; replays never share the original's id
    fn message_id(headers: &HashMap<String, String>) -> Option<String> {
        let event_id = headers.get(headers::EVENT_ID)?;
        Some(match headers.get(headers::REPLAYED_FROM) {
            Some(record_id) => format!("{event_id}:replay:{record_id}"),
            None => event_id.clone(),
        })
    }

    /// Log publishes the stream discarded as duplicates
    ///
    /// For a relay re-publish the original is already stored. For a replay
    /// the id is unique to the dead-letter record, so a duplicate means an
    /// earlier replay of the same record was stored.
    fn note_duplicate(ack: &jetstream::publish::PublishAck, subject: &str, headers: &HashMap<String, String>) {
        if ack.duplicate {
            tracing::warn!(
                subject = %subject,
                stream = %ack.stream,
                sequence = ack.sequence,
                msg_id = ?Self::message_id(headers),
                "Stream discarded publish as duplicate, original already stored"
            );
        }
    }

    fn to_bus_message(nats_msg: &async_nats::Message) -> BusMessage {
        let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

        if let Some(reply) = &nats_msg.reply {
            msg = msg.with_reply_to(reply.to_string());
        }

        if let Some(nats_headers) = &nats_msg.headers {
            let mut headers = HashMap::new();
            for (key, values) in nats_headers.iter() {
                // Take the first value for each header
                if let Some(value) = values.first() {
                    headers.insert(key.to_string(), value.to_string());
                }
            }
            if !headers.is_empty() {
                msg = msg.with_headers(headers);
            }
        }

        msg
    }
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn in_progress(&self) -> BusResult<()> {
        self.0
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn publish_record(&self, record: PublishRecord) -> BusResult<()> {
        let headers = Self::to_header_map(&record.headers);

        let ack = self
            .jetstream
            .publish_with_headers(record.subject.clone(), headers, record.payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;
        Self::note_duplicate(&ack, &record.subject, &record.headers);

        Ok(())
    }

    async fn publish_batch(&self, records: Vec<PublishRecord>) -> BusResult<()> {
        // Send everything first, then wait for the acks in order
        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let headers = Self::to_header_map(&record.headers);
            let ack = self
                .jetstream
                .publish_with_headers(record.subject.clone(), headers, record.payload.into())
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
            pending.push((ack, record.subject, record.headers));
        }

        for (ack, subject, headers) in pending {
            let ack = ack
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
            Self::note_duplicate(&ack, &subject, &headers);
        }

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber
            .map(|nats_msg| Self::to_bus_message(&nats_msg))
            .boxed())
    }

    async fn consume(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        let stream_name = self
            .jetstream
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(format!("no stream for {subject}: {e}")))?;

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let durable = Self::durable_name(group, subject);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        tracing::info!(
            stream = %stream_name,
            consumer = %durable,
            subject = %subject,
            ack_wait_ms = self.ack_wait.as_millis() as u64,
            "Attached to JetStream consumer"
        );

        let deliveries = messages.filter_map(|result| async move {
            match result {
                Ok(js_msg) => {
                    let offset = js_msg.info().map(|i| i.stream_sequence).unwrap_or(0);
                    let message = Self::to_bus_message(&js_msg.message);
                    Some(Delivery::new(message, offset, Arc::new(JetStreamAck(js_msg))))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "JetStream pull failed");
                    None
                }
            }
        });

        Ok(deliveries.boxed())
    }
}
