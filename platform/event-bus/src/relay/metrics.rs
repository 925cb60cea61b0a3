use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

/// Relay counters, registered on a caller-owned registry
#[derive(Clone)]
pub struct RelayMetrics {
    pub published_total: IntCounter,
    pub publish_failures_total: IntCounter,
    /// Unprocessed entries at or above `max_retries`
    pub stalled_entries: IntGauge,
    pub cycle_duration_seconds: Histogram,
}

impl RelayMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let published_total = IntCounter::new(
            "outbox_relay_published_total",
            "Outbox entries published and marked processed",
        )?;
        let publish_failures_total = IntCounter::new(
            "outbox_relay_publish_failures_total",
            "Outbox entries whose publish failed (retry_count incremented)",
        )?;
        let stalled_entries = IntGauge::new(
            "outbox_relay_stalled_entries",
            "Outbox entries that exhausted their retries",
        )?;
        let cycle_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "outbox_relay_cycle_duration_seconds",
            "Duration of one claim/publish/commit cycle",
        ))?;

        registry.register(Box::new(published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(stalled_entries.clone()))?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        Ok(Self {
            published_total,
            publish_failures_total,
            stalled_entries,
            cycle_duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once_per_registry() {
        let registry = Registry::new();
        let metrics = RelayMetrics::new(&registry).unwrap();
        metrics.published_total.inc_by(3);

        assert!(RelayMetrics::new(&registry).is_err());

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"outbox_relay_published_total".to_string()));
        assert!(names.contains(&"outbox_relay_stalled_entries".to_string()));
    }
}
