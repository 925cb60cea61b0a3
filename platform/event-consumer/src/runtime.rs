//! Consumer runtime: pulls deliveries, fans them out to a keyed worker pool,
//! and acknowledges according to the commit strategy.
//!
//! ## Ordering
//!
//! Every delivery is routed to worker `sha256(partition_key) % workers`, and
//! each worker handles its queue sequentially, so messages sharing a key are
//! handled in broker order while different keys proceed concurrently.
//!
//! ## Shutdown
//!
//! [`ConsumerHandle::shutdown`] stops pulling and lets each worker finish the
//! message it is handling, bounded by the grace period. Under manual commit a
//! queued delivery is never started: it stays unacknowledged and the broker
//! redelivers it. Under auto commit queued deliveries were already
//! acknowledged, so workers keep handling them until the grace period runs
//! out; whatever is left then is reported as lost.
//!
//! ## Redelivery deadline
//!
//! Under manual commit a worker sends [`Delivery::in_progress`] every
//! `progress_interval` while its handler runs, so a broker with an ack
//! deadline does not hand the same message to the group again mid-retry.

use event_bus::consumer_retry::RetryConfig;
use event_bus::dlq::DeadLetterSink;
use event_bus::{BusError, Delivery, EventBus};
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CommitStrategy, ConsumerConfig};
use crate::context::DeliveryInfo;
use crate::metrics::ConsumerMetrics;
use crate::registry::HandlerRegistry;
use crate::router::{DispatchOutcome, Router};

/// What the dispatcher and workers do with a delivery
#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    commit_strategy: CommitStrategy,
    progress_interval: Duration,
}

/// Outcome counts since the runtime started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub handled: u64,
    pub dead_lettered: u64,
    pub dead_letter_failed: u64,
    /// Redelivered copies of events already dead-lettered
    pub already_dead_lettered: u64,
    pub unparseable: u64,
    pub no_handler: u64,
}

/// What happened during [`ConsumerHandle::shutdown`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stats: ConsumerStats,
    /// Queued deliveries never started after draining began
    pub not_started: u64,
    /// Handlers still running when the grace period expired
    pub aborted: u64,
    pub grace_expired: bool,
    /// Deliveries the broker will hand out again
    pub left_unacknowledged: u64,
    /// Acknowledged on receipt (auto commit) but never handled to completion
    pub lost: u64,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failed: AtomicU64,
    already_dead_lettered: AtomicU64,
    unparseable: AtomicU64,
    no_handler: AtomicU64,
    not_started: AtomicU64,
    in_flight: AtomicU64,
    /// Acked jobs sitting in a worker queue
    pending_acked: AtomicU64,
    /// Acked jobs dropped before a worker took them
    lost: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Handled { .. } => &self.handled,
            DispatchOutcome::DeadLettered { .. } => &self.dead_lettered,
            DispatchOutcome::DeadLetterFailed { .. } => &self.dead_letter_failed,
            DispatchOutcome::AlreadyDeadLettered { .. } => &self.already_dead_lettered,
            DispatchOutcome::Unparseable { .. } => &self.unparseable,
            DispatchOutcome::NoHandler => &self.no_handler,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            handled: self.handled.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            dead_letter_failed: self.dead_letter_failed.load(Ordering::SeqCst),
            already_dead_lettered: self.already_dead_lettered.load(Ordering::SeqCst),
            unparseable: self.unparseable.load(Ordering::SeqCst),
            no_handler: self.no_handler.load(Ordering::SeqCst),
        }
    }

    /// An acked job will never reach a worker
    fn drop_acked(&self) {
        self.pending_acked.fetch_sub(1, Ordering::SeqCst);
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
}

struct Job {
    topic: String,
    delivery: Delivery,
    /// Acknowledged before queueing (auto commit)
    acked: bool,
}

pub struct ConsumerRuntime {
    bus: Arc<dyn EventBus>,
    router: Arc<Router>,
    config: ConsumerConfig,
}

impl ConsumerRuntime {
    pub fn new(
        bus: Arc<dyn EventBus>,
        registry: HandlerRegistry,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
        metrics: ConsumerMetrics,
    ) -> Self {
        let retry = RetryConfig {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        };
        let router = Router::new(registry, dead_letters, config.group.clone(), metrics)
            .with_retry(retry)
            .with_handler_timeout(config.handler_timeout);

        Self {
            bus,
            router: Arc::new(router),
            config,
        }
    }

    /// Join the consumer group on every configured topic and start handling
    pub async fn start(self) -> Result<ConsumerHandle, BusError> {
        let workers = self.config.workers.max(1);
        let mut streams: Vec<BoxStream<'static, (String, Delivery)>> = Vec::new();

        for topic in &self.config.topics {
            let deliveries = self.bus.consume(topic, &self.config.group).await?;
            let topic = topic.clone();
            streams.push(deliveries.map(move |d| (topic.clone(), d)).boxed());
        }

        info!(
            group = %self.config.group,
            topics = ?self.config.topics,
            workers = workers,
            commit_strategy = ?self.config.commit_strategy,
            "Starting consumer runtime"
        );

        let (drain_tx, drain_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let settings = WorkerSettings {
            commit_strategy: self.config.commit_strategy,
            progress_interval: self.config.progress_interval,
        };

        let mut senders = Vec::with_capacity(workers);
        let mut worker_handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
            senders.push(tx);
            worker_handles.push(tokio::spawn(run_worker(
                index,
                rx,
                self.router.clone(),
                settings,
                drain_rx.clone(),
                counters.clone(),
            )));
        }

        let dispatcher = tokio::spawn(run_dispatcher(
            stream::select_all(streams).boxed(),
            senders,
            self.config.commit_strategy,
            drain_rx,
            counters.clone(),
        ));

        Ok(ConsumerHandle {
            group: self.config.group,
            commit_strategy: self.config.commit_strategy,
            shutdown_grace: self.config.shutdown_grace,
            drain_tx,
            dispatcher,
            workers: worker_handles,
            counters,
        })
    }
}

/// A running consumer
pub struct ConsumerHandle {
    group: String,
    commit_strategy: CommitStrategy,
    shutdown_grace: Duration,
    drain_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Stop pulling, finish in-flight handlers within the grace period, then
    /// stop the workers
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(group = %self.group, "Draining consumer runtime");
        // receivers live in the spawned tasks; a send error means they already exited
        let _ = self.drain_tx.send(true);

        if let Err(e) = (&mut self.dispatcher).await {
            warn!(error = %e, "Consumer dispatcher task failed");
        }

        let grace_expired = tokio::time::timeout(
            self.shutdown_grace,
            join_all(self.workers.iter_mut()),
        )
        .await
        .is_err();

        let mut aborted = 0;
        if grace_expired {
            aborted = self.counters.in_flight.load(Ordering::SeqCst);
            warn!(
                group = %self.group,
                in_flight = aborted,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Shutdown grace period expired, aborting handlers"
            );
            for worker in &self.workers {
                worker.abort();
            }
            // handles already joined above must not be polled again
            join_all(self.workers.iter_mut().filter(|w| !w.is_finished())).await;
        }

        let stats = self.counters.snapshot();
        let not_started = self.counters.not_started.load(Ordering::SeqCst);
        let (left_unacknowledged, lost) = match self.commit_strategy {
            CommitStrategy::ManualAfterHandle => {
                (not_started + aborted + stats.dead_letter_failed, 0)
            }
            // only deliveries whose auto ack failed are skipped
            CommitStrategy::AutoImmediate => (
                not_started,
                self.counters.lost.load(Ordering::SeqCst)
                    + self.counters.pending_acked.load(Ordering::SeqCst)
                    + aborted,
            ),
        };
        if lost > 0 {
            warn!(group = %self.group, lost = lost, "Acknowledged deliveries were not handled");
        }

        let report = ShutdownReport {
            stats,
            not_started,
            aborted,
            grace_expired,
            left_unacknowledged,
            lost,
        };
        info!(group = %self.group, report = ?report, "Consumer runtime stopped");
        report
    }
}

/// Pick the worker that owns a partition key
pub(crate) fn worker_index(partition_key: &str, workers: usize) -> usize {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % workers.max(1) as u64) as usize
}

async fn run_dispatcher(
    mut deliveries: BoxStream<'static, (String, Delivery)>,
    senders: Vec<mpsc::Sender<Job>>,
    commit_strategy: CommitStrategy,
    mut drain: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = drain.changed() => break,
            next = deliveries.next() => next,
        };

        let Some((topic, delivery)) = next else {
            info!("Consumer streams ended");
            break;
        };

        let acked = commit_strategy == CommitStrategy::AutoImmediate
            && match delivery.ack().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(topic = %topic, offset = delivery.offset, error = %e, "Auto-commit ack failed");
                    false
                }
            };
        if acked {
            counters.pending_acked.fetch_add(1, Ordering::SeqCst);
        }

        let sender = &senders[worker_index(&delivery.partition_key, senders.len())];
        let job = Job {
            topic,
            delivery,
            acked,
        };
        tokio::select! {
            biased;
            _ = drain.changed() => {
                if !job.acked {
                    counters.not_started.fetch_add(1, Ordering::SeqCst);
                } else if sender.try_send(job).is_err() {
                    counters.drop_acked();
                }
                break;
            }
            permit = sender.reserve() => match permit {
                Ok(permit) => permit.send(job),
                Err(_) => {
                    warn!("Consumer worker exited, stopping dispatcher");
                    if job.acked {
                        counters.drop_acked();
                    }
                    break;
                }
            }
        }
    }
    // dropping the senders lets idle workers observe the end of their queue
}

async fn run_worker(
    index: usize,
    mut jobs: mpsc::Receiver<Job>,
    router: Arc<Router>,
    settings: WorkerSettings,
    drain: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    while let Some(Job {
        topic,
        delivery,
        acked,
    }) = jobs.recv().await
    {
        if acked {
            counters.pending_acked.fetch_sub(1, Ordering::SeqCst);
        } else if *drain.borrow() {
            counters.not_started.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        counters.in_flight.fetch_add(1, Ordering::SeqCst);

        let info = DeliveryInfo {
            topic,
            partition_key: delivery.partition_key.clone(),
            offset: delivery.offset,
        };

        let outcome = if acked {
            router.dispatch(&delivery.message, &info).await
        } else {
            dispatch_with_progress(&router, &delivery, &info, settings.progress_interval).await
        };

        if settings.commit_strategy == CommitStrategy::ManualAfterHandle && outcome.should_ack() {
            if let Err(e) = delivery.ack().await {
                warn!(
                    topic = %info.topic,
                    offset = info.offset,
                    error = %e,
                    "Ack failed, message will be redelivered"
                );
            }
        }

        counters.record(&outcome);
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker = index, "Consumer worker stopped");
}

/// Dispatch while signalling the broker that the delivery is still in progress
async fn dispatch_with_progress(
    router: &Router,
    delivery: &Delivery,
    info: &DeliveryInfo,
    every: Duration,
) -> DispatchOutcome {
    let dispatch = router.dispatch(&delivery.message, info);
    tokio::pin!(dispatch);
    let mut ticks = interval_at(Instant::now() + every, every);

    loop {
        tokio::select! {
            outcome = &mut dispatch => return outcome,
            _ = ticks.tick() => {
                if let Err(e) = delivery.in_progress().await {
                    debug!(topic = %info.topic, offset = info.offset, error = %e, "In-progress signal failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_index_is_stable_and_in_range() {
        for key in ["T-1", "T-2", "position-9", ""] {
            let index = worker_index(key, 8);
            assert!(index < 8);
            assert_eq!(index, worker_index(key, 8));
        }
        assert_eq!(worker_index("T-1", 1), 0);
    }

    #[test]
    fn test_keys_spread_across_workers() {
        let used: std::collections::HashSet<usize> =
            (0..64).map(|i| worker_index(&format!("T-{}", i), 4)).collect();
        assert_eq!(used.len(), 4);
    }
}
