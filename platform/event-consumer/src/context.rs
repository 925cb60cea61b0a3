//! Per-message context restored from the envelope before dispatch

use event_bus::{EntityRef, EventEnvelope};
use uuid::Uuid;

/// Everything a handler may need besides the payload
///
/// Built fresh for every invocation and dropped when the handler returns, so
/// nothing leaks from one message into the next.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub producer: String,
    pub entity: EntityRef,
    /// Topic the message was consumed from
    pub topic: String,
    pub partition_key: String,
    /// Broker cursor of the delivery
    pub offset: u64,
    pub consumer_group: String,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
}

/// Where a message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub topic: String,
    pub partition_key: String,
    pub offset: u64,
}

impl EventContext {
    pub(crate) fn restore<T>(
        envelope: &EventEnvelope<T>,
        delivery: &DeliveryInfo,
        consumer_group: &str,
        attempt: u32,
    ) -> Self {
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            tenant_id: envelope.tenant_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            causation_id: envelope.causation_id.clone(),
            producer: envelope.producer.clone(),
            entity: envelope.entity.clone(),
            topic: delivery.topic.clone(),
            partition_key: delivery.partition_key.clone(),
            offset: delivery.offset,
            consumer_group: consumer_group.to_string(),
            attempt,
        }
    }

    /// Start an envelope for an event emitted while handling this one
    ///
    /// Tenant and correlation carry over; causation points at the handled event.
    pub fn follow_up<P>(
        &self,
        event_type: impl Into<String>,
        producer: impl Into<String>,
        entity: EntityRef,
        payload: P,
    ) -> EventEnvelope<P> {
        EventEnvelope::new(event_type, producer, self.tenant_id.clone(), entity, payload)
            .with_correlation_id(self.correlation_id.clone())
            .with_causation_id(Some(self.event_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_follow_up_inherits_chain() {
        let parent = EventEnvelope::new(
            "trade.booked",
            "trade-capture",
            "tenant-7",
            EntityRef::new("trade", "T-1", 1),
            json!({}),
        )
        .with_correlation_id("corr-1");
        let delivery = DeliveryInfo {
            topic: "trades".to_string(),
            partition_key: "T-1".to_string(),
            offset: 9,
        };

        let ctx = EventContext::restore(&parent, &delivery, "positions", 1);
        assert_eq!(ctx.tenant_id, "tenant-7");
        assert_eq!(ctx.offset, 9);

        let child = ctx.follow_up(
            "position.updated",
            "positions",
            EntityRef::new("position", "P-1", 4),
            json!({}),
        );
        assert_eq!(child.tenant_id, "tenant-7");
        assert_eq!(child.correlation_id, "corr-1");
        assert_eq!(child.causation_id, Some(parent.event_id.to_string()));
        assert_ne!(child.event_id, parent.event_id);
    }
}
