use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{DeadLetterFilter, DeadLetterRecord, DeadLetterSink, DlqError, NewDeadLetter};

/// Dead-letter sink kept in process memory, for tests and dev runs
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in insertion order
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<DeadLetterRecord>>, DlqError> {
        self.records
            .lock()
            .map_err(|e| DlqError::Internal(format!("dead-letter lock poisoned: {}", e)))
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, dead_letter: NewDeadLetter) -> Result<Uuid, DlqError> {
        let id = Uuid::new_v4();
        tracing::warn!(
            dead_letter_id = %id,
            topic = %dead_letter.original_topic,
            partition_key = %dead_letter.partition_key,
            attempts = dead_letter.attempt_count,
            error = %dead_letter.error,
            "Message recorded in dead-letter sink"
        );
        self.lock()?
            .push(DeadLetterRecord::from_new(id, dead_letter, Utc::now()));
        Ok(id)
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, DlqError> {
        let mut matched: Vec<DeadLetterRecord> = self
            .lock()?
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        // stable sort keeps insertion order among equal timestamps
        matched.sort_by_key(|record| record.first_failed_at);

        if let Some(limit) = filter.limit {
            matched.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(matched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DlqError> {
        Ok(self.lock()?.iter().find(|record| record.id == id).cloned())
    }

    async fn mark_resolved(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<(), DlqError> {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(DlqError::NotFound(id))?;

        if record.resolved_at.is_some() {
            return Err(DlqError::AlreadyResolved(id));
        }
        record.resolved_at = Some(resolved_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DeadLetterPayload;
    use chrono::Duration;

    fn raw(topic: &str, first_failed_at: DateTime<Utc>) -> NewDeadLetter {
        NewDeadLetter {
            original_topic: topic.to_string(),
            partition_key: "k".to_string(),
            original_offset: "1".to_string(),
            payload: DeadLetterPayload::Raw(b"{}".to_vec()),
            error: "boom".to_string(),
            stack_context: String::new(),
            first_failed_at,
            attempt_count: 1,
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_topic_and_date_range() {
        let sink = InMemoryDeadLetterSink::new();
        let now = Utc::now();

        sink.record(raw("trades.events", now - Duration::days(3)))
            .await
            .unwrap();
        let inside = sink
            .record(raw("trades.events", now - Duration::days(1)))
            .await
            .unwrap();
        sink.record(raw("positions.events", now - Duration::days(1)))
            .await
            .unwrap();

        let filter = DeadLetterFilter::topic("trades.events")
            .between(now - Duration::days(2), now);
        let listed = sink.list(&filter).await.unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, inside);
    }

    #[tokio::test]
    async fn test_resolved_records_hidden_unless_requested() {
        let sink = InMemoryDeadLetterSink::new();
        let id = sink.record(raw("trades.events", Utc::now())).await.unwrap();
        sink.mark_resolved(id, Utc::now()).await.unwrap();

        let filter = DeadLetterFilter::topic("trades.events");
        assert!(sink.list(&filter).await.unwrap().is_empty());
        assert_eq!(sink.list(&filter.including_resolved()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_is_append_only() {
        let sink = InMemoryDeadLetterSink::new();
        let now = Utc::now();
        let first = sink.record(raw("trades.events", now)).await.unwrap();
        let second = sink.record(raw("trades.events", now)).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_resolved_only_once() {
        let sink = InMemoryDeadLetterSink::new();
        let id = sink.record(raw("trades.events", Utc::now())).await.unwrap();

        sink.mark_resolved(id, Utc::now()).await.unwrap();
        assert!(matches!(
            sink.mark_resolved(id, Utc::now()).await,
            Err(DlqError::AlreadyResolved(_))
        ));
        assert!(matches!(
            sink.mark_resolved(Uuid::new_v4(), Utc::now()).await,
            Err(DlqError::NotFound(_))
        ));
    }
}
