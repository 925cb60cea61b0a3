use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

/// Consumer counters, registered on a caller-owned registry
#[derive(Clone)]
pub struct ConsumerMetrics {
    /// outcome: handled|dead_lettered|dead_letter_failed|no_handler|unparseable
    pub messages_total: IntCounterVec,
    pub unparseable_total: IntCounterVec,
    pub dead_lettered_total: IntCounterVec,
    pub handler_duration_seconds: Histogram,
}

impl ConsumerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let messages_total = IntCounterVec::new(
            Opts::new("event_consumer_messages_total", "Messages dispatched by outcome"),
            &["outcome"],
        )?;
        let unparseable_total = IntCounterVec::new(
            Opts::new(
                "event_consumer_unparseable_total",
                "Messages that failed to decode as an envelope",
            ),
            &["topic"],
        )?;
        let dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "event_consumer_dead_lettered_total",
                "Messages forwarded to the dead-letter sink",
            ),
            &["event_type"],
        )?;
        let handler_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "event_consumer_handler_duration_seconds",
            "Handler invocation duration, retries included",
        ))?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(unparseable_total.clone()))?;
        registry.register(Box::new(dead_lettered_total.clone()))?;
        registry.register(Box::new(handler_duration_seconds.clone()))?;

        Ok(Self {
            messages_total,
            unparseable_total,
            dead_lettered_total,
            handler_duration_seconds,
        })
    }

    /// Metrics on a private registry, for tests and embedded use
    pub fn unregistered() -> Self {
        // a fresh registry cannot hold duplicates
        Self::new(&Registry::new()).unwrap_or_else(|e| unreachable!("fresh registry: {e}"))
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.messages_total.with_label_values(&[outcome]).get()
    }

    pub fn unparseable_count(&self, topic: &str) -> u64 {
        self.unparseable_total.with_label_values(&[topic]).get()
    }
}
