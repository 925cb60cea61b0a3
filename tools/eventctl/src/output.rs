//! JSON-lines rendering of operator output

use event_bus::dlq::{DeadLetterPayload, DeadLetterRecord, ReplayOutcome};
use event_bus::outbox::OutboxEntry;
use serde_json::{json, Value};

pub fn dead_letter(record: &DeadLetterRecord) -> Value {
    let (event_type, event_id) = match &record.payload {
        DeadLetterPayload::Envelope(envelope) => {
            (Some(envelope.event_type.as_str()), Some(envelope.event_id))
        }
        DeadLetterPayload::Raw(_) => (None, None),
    };

    json!({
        "id": record.id,
        "topic": record.original_topic,
        "partition_key": record.partition_key,
        "offset": record.original_offset,
        "event_type": event_type,
        "event_id": event_id,
        "error": record.error,
        "attempt_count": record.attempt_count,
        "first_failed_at": record.first_failed_at,
        "recorded_at": record.recorded_at,
        "resolved_at": record.resolved_at,
    })
}

pub fn replay(outcome: &ReplayOutcome) -> Value {
    json!({
        "replayed": outcome.record_id,
        "topic": outcome.topic,
        "event_id": outcome.event_id,
        "resolved_at": outcome.resolved_at,
    })
}

pub fn outbox_entry(entry: &OutboxEntry) -> Value {
    json!({
        "id": entry.id,
        "sequence_number": entry.sequence_number,
        "event_type": entry.event_type,
        "tenant_id": entry.tenant_id,
        "entity_type": entry.entity_type,
        "entity_id": entry.entity_id,
        "entity_sequence": entry.entity_sequence,
        "retry_count": entry.retry_count,
        "last_error": entry.last_error,
        "created_at": entry.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use event_bus::{EntityRef, EventEnvelope};
    use uuid::Uuid;

    fn record(payload: DeadLetterPayload) -> DeadLetterRecord {
        DeadLetterRecord {
            id: Uuid::new_v4(),
            original_topic: "trades.events".to_string(),
            partition_key: "T-1".to_string(),
            original_offset: "42".to_string(),
            payload,
            error: "permanent handler error: unknown instrument".to_string(),
            stack_context: String::new(),
            first_failed_at: Utc::now(),
            attempt_count: 1,
            recorded_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_dead_letter_line_names_the_event() {
        let envelope = EventEnvelope::new(
            "trade.booked",
            "trade-capture",
            "tenant-1",
            EntityRef::new("trade", "T-1", 1),
            json!({}),
        );
        let line = dead_letter(&record(DeadLetterPayload::Envelope(envelope.clone())));

        assert_eq!(line["topic"], "trades.events");
        assert_eq!(line["offset"], "42");
        assert_eq!(line["event_type"], "trade.booked");
        assert_eq!(line["event_id"], envelope.event_id.to_string());
        assert!(line["resolved_at"].is_null());
    }

    #[test]
    fn test_raw_dead_letter_has_no_event_fields() {
        let line = dead_letter(&record(DeadLetterPayload::Raw(b"garbage".to_vec())));
        assert!(line["event_type"].is_null());
        assert!(line["event_id"].is_null());
        assert_eq!(line["attempt_count"], 1);
    }
}
