//! Consumer runtime against the in-memory bus and dead-letter sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::dlq::{
    self, DeadLetterFilter, DeadLetterRecord, DeadLetterSink, DlqError, InMemoryDeadLetterSink,
    NewDeadLetter,
};
use event_bus::{EntityRef, EventBus, EventEnvelope, InMemoryBus, PublishRecord};
use event_consumer::{
    handler_fn, CommitStrategy, ConsumerConfig, ConsumerHandle, ConsumerMetrics,
    ConsumerRuntime, HandlerError, HandlerRegistry, InMemorySequenceGuard,
};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const TOPIC: &str = "trades.events";
const GROUP: &str = "positions";

fn envelope(event_type: &str, entity_id: &str, sequence: i64) -> EventEnvelope<Value> {
    EventEnvelope::new(
        event_type,
        "trade-capture",
        "tenant-1",
        EntityRef::new("trade", entity_id, sequence),
        json!({ "sequence": sequence }),
    )
}

async fn publish(bus: &InMemoryBus, envelope: &EventEnvelope<Value>) {
    let record = PublishRecord::new(TOPIC, envelope.partition_key(), envelope.to_bytes().unwrap());
    bus.publish_record(record).await.unwrap();
}

fn config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new(GROUP, vec![TOPIC.to_string()]);
    config.workers = 4;
    config.max_attempts = 3;
    config.initial_backoff = Duration::from_millis(1);
    config.max_backoff = Duration::from_millis(5);
    config.handler_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_secs(5);
    config
}

async fn start(
    bus: &InMemoryBus,
    registry: HandlerRegistry,
    sink: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    metrics: ConsumerMetrics,
) -> ConsumerHandle {
    ConsumerRuntime::new(Arc::new(bus.clone()), registry, sink, config, metrics)
        .start()
        .await
        .unwrap()
}

/// Poll until `done` holds or fail after two seconds
async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Sink whose writes always fail
struct BrokenSink;

#[async_trait]
impl DeadLetterSink for BrokenSink {
    async fn record(&self, _dead_letter: NewDeadLetter) -> Result<Uuid, DlqError> {
        Err(DlqError::Internal("dead-letter store unavailable".to_string()))
    }

    async fn list(&self, _filter: &DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, DlqError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: Uuid) -> Result<Option<DeadLetterRecord>, DlqError> {
        Ok(None)
    }

    async fn mark_resolved(&self, id: Uuid, _resolved_at: DateTime<Utc>) -> Result<(), DlqError> {
        Err(DlqError::NotFound(id))
    }
}

fn always_failing(calls: Arc<AtomicU32>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "trade.booked",
            handler_fn(move |_ctx, _envelope| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::transient("position store unavailable"))
                }
            }),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_failing_handler_is_dead_lettered_once_and_acked() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));
    let handle = start(
        &bus,
        always_failing(calls.clone()),
        sink.clone(),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;

    let event = envelope("trade.booked", "T-1", 1);
    publish(&bus, &event).await;

    wait_until(|| bus.acknowledged(GROUP).len() == 1).await;
    let report = handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.dead_lettered, 1);
    assert_eq!(report.left_unacknowledged, 0);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_topic, TOPIC);
    assert_eq!(records[0].partition_key, "T-1");
    assert_eq!(records[0].attempt_count, 3);
    assert_eq!(records[0].payload.event_id(), Some(event.event_id));
    assert!(records[0].error.contains("position store unavailable"));
}

#[tokio::test]
async fn test_unparseable_message_never_reaches_a_handler() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));
    let metrics = ConsumerMetrics::unregistered();
    let handle = start(
        &bus,
        always_failing(calls.clone()),
        sink.clone(),
        config(),
        metrics.clone(),
    )
    .await;

    bus.publish_record(PublishRecord::new(TOPIC, "T-1", b"not an envelope".to_vec()))
        .await
        .unwrap();

    wait_until(|| bus.acknowledged(GROUP).len() == 1).await;
    let report = handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(sink.records().is_empty());
    assert_eq!(report.stats.unparseable, 1);
    assert_eq!(metrics.unparseable_count(TOPIC), 1);
}

#[tokio::test]
async fn test_events_for_one_entity_are_handled_in_order() {
    let bus = InMemoryBus::new();
    let seen: Arc<Mutex<HashMap<String, Vec<i64>>>> = Arc::default();

    let mut registry = HandlerRegistry::new();
    let recorder = seen.clone();
    registry
        .register(
            "trade.booked",
            handler_fn(move |ctx, _envelope| {
                let recorder = recorder.clone();
                async move {
                    let delay = rand::thread_rng().gen_range(0..5);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    recorder
                        .lock()
                        .unwrap()
                        .entry(ctx.entity.entity_id.clone())
                        .or_default()
                        .push(ctx.entity.sequence);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = start(
        &bus,
        registry,
        Arc::new(InMemoryDeadLetterSink::new()),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;

    for sequence in 1..=10 {
        for entity in ["T-1", "T-2", "T-3"] {
            publish(&bus, &envelope("trade.booked", entity, sequence)).await;
        }
    }

    wait_until(|| bus.acknowledged(GROUP).len() == 30).await;
    let report = handle.shutdown().await;
    assert_eq!(report.stats.handled, 30);

    let seen = seen.lock().unwrap();
    for entity in ["T-1", "T-2", "T-3"] {
        assert_eq!(seen[entity], (1..=10).collect::<Vec<i64>>(), "order for {entity}");
    }
}

#[tokio::test]
async fn test_unregistered_event_type_is_acknowledged() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));
    let handle = start(
        &bus,
        always_failing(calls.clone()),
        sink.clone(),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;

    publish(&bus, &envelope("trade.cancelled", "T-1", 1)).await;

    wait_until(|| bus.acknowledged(GROUP).len() == 1).await;
    let report = handle.shutdown().await;

    assert_eq!(report.stats.no_handler, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_permanent_error_skips_retries() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = calls.clone();
    registry
        .register(
            "trade.booked",
            handler_fn(move |_ctx, _envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::permanent("instrument not found"))
                }
            }),
        )
        .unwrap();

    let mut config = config();
    config.max_attempts = 5;
    let handle = start(&bus, registry, sink.clone(), config, ConsumerMetrics::unregistered()).await;

    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;

    wait_until(|| sink.records().len() == 1).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.records()[0].attempt_count, 1);
}

#[tokio::test]
async fn test_slow_handler_times_out_into_dead_letter() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "trade.booked",
            handler_fn(|_ctx, _envelope| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .unwrap();

    let mut config = config();
    config.handler_timeout = Duration::from_millis(20);
    config.max_attempts = 2;
    let handle = start(&bus, registry, sink.clone(), config, ConsumerMetrics::unregistered()).await;

    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;

    wait_until(|| bus.acknowledged(GROUP).len() == 1).await;
    handle.shutdown().await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt_count, 2);
    assert!(records[0].error.contains("timed out"));
}

#[tokio::test]
async fn test_dead_letter_write_failure_depends_on_commit_strategy() {
    // manual: the delivery stays unacknowledged for redelivery
    let bus = InMemoryBus::new();
    let handle = start(
        &bus,
        always_failing(Arc::new(AtomicU32::new(0))),
        Arc::new(BrokenSink),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;
    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;

    wait_until(|| handle.stats().dead_letter_failed == 1).await;
    let report = handle.shutdown().await;
    assert!(bus.acknowledged(GROUP).is_empty());
    assert_eq!(report.left_unacknowledged, 1);

    // auto: acknowledged on receipt, before the handler ran
    let bus = InMemoryBus::new();
    let mut config = config();
    config.commit_strategy = CommitStrategy::AutoImmediate;
    let handle = start(
        &bus,
        always_failing(Arc::new(AtomicU32::new(0))),
        Arc::new(BrokenSink),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;
    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;

    wait_until(|| handle.stats().dead_letter_failed == 1).await;
    let report = handle.shutdown().await;
    assert_eq!(bus.acknowledged(GROUP).len(), 1);
    assert_eq!(report.left_unacknowledged, 0);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_and_skips_queued() {
    let bus = InMemoryBus::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = calls.clone();
    registry
        .register(
            "trade.booked",
            handler_fn(move |ctx, _envelope| {
                let counter = counter.clone();
                let started = started_tx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = started.send(ctx.entity.sequence);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();

    let mut config = config();
    config.workers = 1;
    let handle = start(
        &bus,
        registry,
        Arc::new(InMemoryDeadLetterSink::new()),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;

    for sequence in 1..=3 {
        publish(&bus, &envelope("trade.booked", "T-1", sequence)).await;
    }

    assert_eq!(started_rx.recv().await, Some(1));
    // let the dispatcher queue the other two behind the running handler
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = handle.shutdown().await;

    assert!(!report.grace_expired);
    assert_eq!(report.stats.handled, 1);
    assert_eq!(report.not_started, 2);
    assert_eq!(report.left_unacknowledged, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.acknowledged(GROUP), vec![(TOPIC.to_string(), 1)]);
}

/// Handler that reports each sequence it starts, then sleeps
fn slow_registry(
    started_tx: tokio::sync::mpsc::UnboundedSender<i64>,
    calls: Arc<AtomicU32>,
    sleep: Duration,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "trade.booked",
            handler_fn(move |ctx, _envelope| {
                let calls = calls.clone();
                let started = started_tx.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = started.send(ctx.entity.sequence);
                    tokio::time::sleep(sleep).await;
                    Ok(())
                }
            }),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_auto_commit_shutdown_still_handles_acked_queue() {
    let bus = InMemoryBus::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let calls = Arc::new(AtomicU32::new(0));

    let mut config = config();
    config.workers = 1;
    config.commit_strategy = CommitStrategy::AutoImmediate;
    let handle = start(
        &bus,
        slow_registry(started_tx, calls.clone(), Duration::from_millis(100)),
        Arc::new(InMemoryDeadLetterSink::new()),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;

    for sequence in 1..=3 {
        publish(&bus, &envelope("trade.booked", "T-1", sequence)).await;
    }

    assert_eq!(started_rx.recv().await, Some(1));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = handle.shutdown().await;

    assert!(!report.grace_expired);
    assert_eq!(bus.acknowledged(GROUP).len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.handled, 3);
    assert_eq!(report.not_started, 0);
    assert_eq!(report.lost, 0);
    assert_eq!(report.left_unacknowledged, 0);
}

#[tokio::test]
async fn test_auto_commit_reports_acked_work_cut_off_by_grace() {
    let bus = InMemoryBus::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let calls = Arc::new(AtomicU32::new(0));

    let mut config = config();
    config.workers = 1;
    config.commit_strategy = CommitStrategy::AutoImmediate;
    config.shutdown_grace = Duration::from_millis(50);
    config.handler_timeout = Duration::from_secs(60);
    let handle = start(
        &bus,
        slow_registry(started_tx, calls.clone(), Duration::from_secs(30)),
        Arc::new(InMemoryDeadLetterSink::new()),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;

    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;
    publish(&bus, &envelope("trade.booked", "T-1", 2)).await;
    assert_eq!(started_rx.recv().await, Some(1));
    wait_until(|| bus.acknowledged(GROUP).len() == 2).await;

    let report = handle.shutdown().await;

    assert!(report.grace_expired);
    assert_eq!(report.aborted, 1);
    assert_eq!(report.lost, 2);
    assert_eq!(report.left_unacknowledged, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_long_handler_keeps_delivery_in_progress() {
    let bus = InMemoryBus::new();
    let (started_tx, _started_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut config = config();
    config.progress_interval = Duration::from_millis(20);
    let handle = start(
        &bus,
        slow_registry(started_tx, Arc::new(AtomicU32::new(0)), Duration::from_millis(150)),
        Arc::new(InMemoryDeadLetterSink::new()),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;

    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;
    wait_until(|| bus.acknowledged(GROUP).len() == 1).await;
    let report = handle.shutdown().await;

    let signals = bus.in_progress_signals(GROUP);
    assert!(signals.len() >= 3, "only {} in-progress signals", signals.len());
    assert!(signals.iter().all(|s| *s == (TOPIC.to_string(), 1)));
    assert_eq!(report.stats.handled, 1);
}

#[tokio::test]
async fn test_redelivered_dead_letter_yields_one_record() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));

    let handle = start(
        &bus,
        always_failing(calls.clone()),
        sink.clone(),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;

    // the broker hands the same event out a second time
    let event = envelope("trade.booked", "T-1", 1);
    publish(&bus, &event).await;
    publish(&bus, &event).await;

    wait_until(|| bus.acknowledged(GROUP).len() == 2).await;
    let report = handle.shutdown().await;

    assert_eq!(report.stats.dead_lettered, 1);
    assert_eq!(report.stats.already_dead_lettered, 1);
    assert_eq!(sink.records().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_aborts_handlers_past_grace() {
    let bus = InMemoryBus::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "trade.booked",
            handler_fn(move |_ctx, _envelope| {
                let started = started_tx.clone();
                async move {
                    let _ = started.send(());
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();

    let mut config = config();
    config.shutdown_grace = Duration::from_millis(50);
    config.handler_timeout = Duration::from_secs(60);
    let handle = start(
        &bus,
        registry,
        Arc::new(InMemoryDeadLetterSink::new()),
        config,
        ConsumerMetrics::unregistered(),
    )
    .await;

    publish(&bus, &envelope("trade.booked", "T-1", 1)).await;
    started_rx.recv().await.unwrap();

    let report = handle.shutdown().await;

    assert!(report.grace_expired);
    assert_eq!(report.aborted, 1);
    assert_eq!(report.left_unacknowledged, 1);
    assert!(bus.acknowledged(GROUP).is_empty());
}

#[tokio::test]
async fn test_replayed_dead_letter_is_handled_with_original_event_id() {
    let bus = InMemoryBus::new();
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let healthy = Arc::new(AtomicBool::new(false));
    let handled: Arc<Mutex<Vec<Uuid>>> = Arc::default();

    let mut registry = HandlerRegistry::new();
    let (flag, recorder) = (healthy.clone(), handled.clone());
    registry
        .register(
            "trade.booked",
            handler_fn(move |ctx, _envelope| {
                let (flag, recorder) = (flag.clone(), recorder.clone());
                async move {
                    if !flag.load(Ordering::SeqCst) {
                        return Err(HandlerError::permanent("reference data missing"));
                    }
                    recorder.lock().unwrap().push(ctx.event_id);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = start(&bus, registry, sink.clone(), config(), ConsumerMetrics::unregistered()).await;

    let event = envelope("trade.booked", "T-1", 1);
    publish(&bus, &event).await;
    wait_until(|| sink.records().len() == 1).await;

    // operator fixes the reference data, then replays
    healthy.store(true, Ordering::SeqCst);
    let record_id = sink.records()[0].id;
    let outcome = dlq::replay(sink.as_ref(), &bus, record_id).await.unwrap();
    assert_eq!(outcome.event_id, Some(event.event_id));

    wait_until(|| handled.lock().unwrap().len() == 1).await;
    handle.shutdown().await;

    assert_eq!(*handled.lock().unwrap(), vec![event.event_id]);
    assert!(sink.records()[0].is_resolved());
    assert!(matches!(
        dlq::replay(sink.as_ref(), &bus, record_id).await,
        Err(DlqError::AlreadyResolved(_))
    ));
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once_with_sequence_guard() {
    let bus = InMemoryBus::new();
    let guard = InMemorySequenceGuard::new();
    let applied = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = applied.clone();
    registry
        .register(
            "trade.booked",
            handler_fn(move |ctx, _envelope| {
                let (guard, counter) = (guard.clone(), counter.clone());
                async move {
                    let check = guard.apply_once(&ctx.entity, ctx.event_id).map_err(HandlerError::other)?;
                    if check.is_applied() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = start(
        &bus,
        registry,
        Arc::new(InMemoryDeadLetterSink::new()),
        config(),
        ConsumerMetrics::unregistered(),
    )
    .await;

    let first = envelope("trade.booked", "T-1", 1);
    let second = envelope("trade.booked", "T-1", 2);
    publish(&bus, &first).await;
    publish(&bus, &second).await;
    publish(&bus, &first).await;

    wait_until(|| bus.acknowledged(GROUP).len() == 3).await;
    let report = handle.shutdown().await;

    assert_eq!(report.stats.handled, 3);
    assert_eq!(applied.load(Ordering::SeqCst), 2);
}
