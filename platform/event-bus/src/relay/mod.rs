//! # Outbox Relay
//!
//! Drains the outbox into the broker. One cycle:
//!
//! 1. Claim up to `batch_size` unprocessed entries in `sequence_number` order
//!    (rows held by another relay are skipped).
//! 2. Group them by destination ([`DestinationMap`]).
//! 3. Publish each group as one ordered batch keyed by `entityId`; groups run
//!    concurrently, each bounded by `publish_timeout`.
//! 4. Mark a successful group processed; record the failure on every entry
//!    of a failed group. Entries reaching `max_retries` stall.
//! 5. Commit regardless of per-group outcome.
//!
//! A crash after step 3 and before step 5 rolls the claim back, so the batch
//! is published again next cycle (at-least-once).

mod metrics;
mod routing;

pub use metrics::RelayMetrics;
pub use routing::{Destination, DestinationMap, InvalidRoute};

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dlq::{DeadLetterPayload, DeadLetterSink, NewDeadLetter};
use crate::outbox::{OutboxEntry, OutboxError, OutboxQueue};
use crate::{headers, EventBus, PublishRecord};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("outbox store error: {0}")]
    Store(#[from] OutboxError),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub max_retries: i32,
    /// Upper bound on one destination group's publish
    pub publish_timeout: Duration,
    pub destinations: DestinationMap,
    /// Delete processed entries older than this; `None` keeps them forever
    pub purge_after: Option<Duration>,
    /// How often the stalled gauge is refreshed and purge runs
    pub maintenance_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_retries: 5,
            publish_timeout: Duration::from_secs(5),
            destinations: DestinationMap::new("events.unrouted"),
            purge_after: None,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Counts for one [`Relay::run_cycle`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Entries that reached `max_retries` in this cycle
    pub stalled: usize,
}

/// Entries of one batch bound for the same topic, in claim order
struct DestinationGroup {
    topic: String,
    entries: Vec<OutboxEntry>,
}

impl DestinationGroup {
    fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

pub struct Relay {
    store: Arc<dyn OutboxQueue>,
    bus: Arc<dyn EventBus>,
    config: RelayConfig,
    metrics: RelayMetrics,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl Relay {
    pub fn new(
        store: Arc<dyn OutboxQueue>,
        bus: Arc<dyn EventBus>,
        config: RelayConfig,
        metrics: RelayMetrics,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            metrics,
            dead_letters: None,
        }
    }

    /// Also record entries that stall in the dead-letter sink
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one claim/publish/commit cycle
    pub async fn run_cycle(&self) -> Result<CycleReport, RelayError> {
        let started = Instant::now();
        let mut batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.max_retries)
            .await?;

        let mut report = CycleReport {
            claimed: batch.entries().len(),
            ..CycleReport::default()
        };
        if report.claimed == 0 {
            batch.commit().await?;
            return Ok(report);
        }

        let groups = self.group_by_destination(batch.entries());
        let results = join_all(groups.iter().map(|group| self.publish_group(group))).await;

        let processed_at = Utc::now();
        let mut newly_stalled = Vec::new();

        for (group, result) in groups.iter().zip(results) {
            let ids = group.ids();
            match result {
                Ok(()) => {
                    batch.mark_processed(&ids, processed_at).await?;
                    report.published += ids.len();
                    self.metrics.published_total.inc_by(ids.len() as u64);
                    debug!(
                        topic = %group.topic,
                        count = ids.len(),
                        "Destination group published"
                    );
                }
                Err(reason) => {
                    let updates = batch.record_failure(&ids, &reason).await?;
                    report.failed += ids.len();
                    self.metrics.publish_failures_total.inc_by(ids.len() as u64);
                    warn!(
                        topic = %group.topic,
                        count = ids.len(),
                        error = %reason,
                        "Destination group publish failed, will retry next cycle"
                    );

                    for update in updates
                        .iter()
                        .filter(|u| u.retry_count >= self.config.max_retries)
                    {
                        if let Some(entry) = group.entries.iter().find(|e| e.id == update.id) {
                            newly_stalled.push((
                                group.topic.clone(),
                                entry.clone(),
                                update.retry_count,
                                reason.clone(),
                            ));
                        }
                    }
                }
            }
        }

        batch.commit().await?;

        report.stalled = newly_stalled.len();
        if report.stalled > 0 {
            self.metrics.stalled_entries.add(report.stalled as i64);
        }
        for (topic, entry, retry_count, reason) in newly_stalled {
            self.surface_stalled(topic, entry, retry_count, reason).await;
        }

        self.metrics
            .cycle_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        Ok(report)
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped)
    ///
    /// A full batch triggers the next cycle immediately; errors are logged
    /// and the loop continues on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Starting outbox relay"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = maintenance.tick() => self.maintain().await,
                _ = poll.tick() => self.drain().await,
            }
        }

        info!("Outbox relay stopped");
    }

    /// Unprocessed entries that exhausted their retries; refreshes the gauge
    pub async fn stalled_report(&self) -> Result<Vec<OutboxEntry>, RelayError> {
        let stalled = self.store.stalled(self.config.max_retries).await?;
        self.metrics.stalled_entries.set(stalled.len() as i64);
        Ok(stalled)
    }

    async fn drain(&self) {
        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        debug!(
                            claimed = report.claimed,
                            published = report.published,
                            failed = report.failed,
                            stalled = report.stalled,
                            "Relay cycle complete"
                        );
                    }
                    // a full batch means more work is probably waiting
                    if (report.claimed as i64) < self.config.batch_size {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Relay cycle failed");
                    return;
                }
            }
        }
    }

    async fn maintain(&self) {
        match self.stalled_report().await {
            Ok(stalled) if !stalled.is_empty() => {
                warn!(count = stalled.len(), "Outbox has stalled entries");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to refresh stalled outbox entries"),
        }

        let Some(age) = self.config.purge_after else {
            return;
        };
        let before = match chrono::Duration::from_std(age) {
            Ok(age) => Utc::now() - age,
            Err(e) => {
                error!(error = %e, "Invalid purge age, skipping purge");
                return;
            }
        };
        match self.store.purge_processed(before).await {
            Ok(0) => {}
            Ok(count) => info!(count = count, before = %before, "Purged processed outbox entries"),
            Err(e) => error!(error = %e, "Failed to purge processed outbox entries"),
        }
    }

    fn group_by_destination(&self, entries: &[OutboxEntry]) -> Vec<DestinationGroup> {
        let mut groups: Vec<DestinationGroup> = Vec::new();

        for entry in entries {
            let destination = self.config.destinations.resolve(&entry.event_type);
            if destination.is_fallback() {
                warn!(
                    event_id = %entry.id,
                    event_type = %entry.event_type,
                    topic = %destination.topic(),
                    "No route for event type, using default destination"
                );
            }

            match groups.iter_mut().find(|g| g.topic == destination.topic()) {
                Some(group) => group.entries.push(entry.clone()),
                None => groups.push(DestinationGroup {
                    topic: destination.topic().to_string(),
                    entries: vec![entry.clone()],
                }),
            }
        }

        groups
    }

    async fn publish_group(&self, group: &DestinationGroup) -> Result<(), String> {
        let records = group
            .entries
            .iter()
            .map(|entry| publish_record(&group.topic, entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("serialization error: {}", e))?;

        match tokio::time::timeout(self.config.publish_timeout, self.bus.publish_batch(records))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {}ms",
                self.config.publish_timeout.as_millis()
            )),
        }
    }

    async fn surface_stalled(
        &self,
        topic: String,
        entry: OutboxEntry,
        retry_count: i32,
        reason: String,
    ) {
        error!(
            event_id = %entry.id,
            event_type = %entry.event_type,
            tenant_id = %entry.tenant_id,
            entity_id = %entry.entity_id,
            sequence_number = entry.sequence_number,
            retry_count = retry_count,
            error = %reason,
            "Outbox entry stalled after exhausting retries"
        );

        let Some(sink) = &self.dead_letters else {
            return;
        };

        let dead_letter = NewDeadLetter {
            original_topic: topic,
            partition_key: entry.entity_id.clone(),
            original_offset: entry.sequence_number.to_string(),
            payload: DeadLetterPayload::Envelope(entry.envelope()),
            stack_context: format!(
                "outbox relay: retry_count={} max_retries={} created_at={}",
                retry_count, self.config.max_retries, entry.created_at
            ),
            error: reason,
            first_failed_at: Utc::now(),
            attempt_count: retry_count,
        };

        if let Err(e) = sink.record(dead_letter).await {
            error!(
                event_id = %entry.id,
                error = %e,
                "Failed to record stalled outbox entry in dead-letter sink"
            );
        }
    }
}

fn publish_record(topic: &str, entry: &OutboxEntry) -> Result<PublishRecord, serde_json::Error> {
    let envelope = entry.envelope();
    Ok(PublishRecord::new(topic, &entry.entity_id, envelope.to_bytes()?)
        .with_header(headers::TENANT_ID, &entry.tenant_id)
        .with_header(headers::EVENT_TYPE, &entry.event_type)
        .with_header(headers::CORRELATION_ID, &entry.correlation_id)
        .with_header(headers::EVENT_ID, entry.id.to_string()))
}
