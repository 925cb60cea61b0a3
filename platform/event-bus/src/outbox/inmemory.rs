use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{FailureUpdate, NewOutboxEntry, OutboxBatch, OutboxEntry, OutboxError, OutboxQueue};
use crate::EventEnvelope;

#[derive(Default)]
struct StoreState {
    next_sequence: i64,
    /// Committed entries keyed by sequence number
    entries: BTreeMap<i64, OutboxEntry>,
    /// Sequence numbers held by an open batch
    locked: HashSet<i64>,
}

/// In-memory outbox for tests and local development
///
/// Mirrors the PostgreSQL semantics the relay depends on:
/// - appends are staged in an [`InMemoryOutboxTransaction`] and become visible
///   only on commit; sequence numbers are taken at append time, so a rollback
///   leaves a gap
/// - claimed entries are locked until their batch commits or is dropped, and
///   concurrent claims skip them
/// - batch updates apply atomically on commit
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, OutboxError> {
        self.state
            .lock()
            .map_err(|_| OutboxError::Internal("outbox state poisoned".to_string()))
    }

    /// Start a transaction to append entries in
    pub fn begin(&self) -> InMemoryOutboxTransaction {
        InMemoryOutboxTransaction {
            store: self.clone(),
            staged: Vec::new(),
            open: true,
        }
    }

    /// Committed entry by id, processed or not
    pub fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.lock()?.entries.values().find(|e| e.id == id).cloned())
    }

    /// All committed entries in sequence order
    pub fn entries(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(self.lock()?.entries.values().cloned().collect())
    }
}

/// Staged appends, visible to the relay only after [`commit`](Self::commit)
///
/// Dropping the transaction without committing rolls it back.
pub struct InMemoryOutboxTransaction {
    store: InMemoryOutboxStore,
    staged: Vec<OutboxEntry>,
    open: bool,
}

impl InMemoryOutboxTransaction {
    /// Append an event; returns its sequence number
    pub fn append<T: Serialize>(&mut self, envelope: &EventEnvelope<T>) -> Result<i64, OutboxError> {
        if !self.open {
            return Err(OutboxError::TransactionClosed);
        }

        let new = NewOutboxEntry::from_envelope(envelope)?;
        let sequence_number = {
            let mut state = self.store.lock()?;
            state.next_sequence += 1;
            state.next_sequence
        };

        self.staged.push(OutboxEntry {
            id: new.id,
            sequence_number,
            event_type: new.event_type,
            event_version: new.event_version,
            occurred_at: new.occurred_at,
            producer: new.producer,
            tenant_id: new.tenant_id,
            correlation_id: new.correlation_id,
            causation_id: new.causation_id,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            entity_sequence: new.entity_sequence,
            payload: new.payload,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        });

        Ok(sequence_number)
    }

    pub fn commit(mut self) -> Result<(), OutboxError> {
        if !self.open {
            return Err(OutboxError::TransactionClosed);
        }

        let mut state = self.store.lock()?;
        if state.entries.values().any(|e| self.staged.iter().any(|s| s.id == e.id)) {
            return Err(OutboxError::Internal(
                "duplicate outbox entry id".to_string(),
            ));
        }
        for entry in self.staged.drain(..) {
            state.entries.insert(entry.sequence_number, entry);
        }
        self.open = false;

        Ok(())
    }

    pub fn rollback(mut self) {
        self.staged.clear();
        self.open = false;
    }
}

enum StagedUpdate {
    Processed(Vec<Uuid>, DateTime<Utc>),
    Failed(Vec<Uuid>, String),
}

struct InMemoryOutboxBatch {
    store: InMemoryOutboxStore,
    entries: Vec<OutboxEntry>,
    updates: Vec<StagedUpdate>,
    released: bool,
}

impl InMemoryOutboxBatch {
    fn release(&mut self, state: &mut StoreState) {
        for entry in &self.entries {
            state.locked.remove(&entry.sequence_number);
        }
        self.released = true;
    }

    fn claimed_sequence(&self, id: &Uuid) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.id == *id)
            .map(|e| e.sequence_number)
    }
}

impl Drop for InMemoryOutboxBatch {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let state = self.store.state.clone();
        if let Ok(mut state) = state.lock() {
            self.release(&mut state);
        };
    }
}

#[async_trait]
impl OutboxBatch for InMemoryOutboxBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_processed(
        &mut self,
        ids: &[Uuid],
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.updates
            .push(StagedUpdate::Processed(ids.to_vec(), processed_at));
        Ok(())
    }

    async fn record_failure(
        &mut self,
        ids: &[Uuid],
        error: &str,
    ) -> Result<Vec<FailureUpdate>, OutboxError> {
        let mut counts = Vec::with_capacity(ids.len());
        {
            let state = self.store.lock()?;
            for id in ids {
                let Some(seq) = self.claimed_sequence(id) else {
                    continue;
                };
                let committed = state.entries.get(&seq).map(|e| e.retry_count).unwrap_or(0);
                let staged = self
                    .updates
                    .iter()
                    .filter(|u| matches!(u, StagedUpdate::Failed(failed, _) if failed.contains(id)))
                    .count() as i32;
                counts.push(FailureUpdate {
                    id: *id,
                    retry_count: committed + staged + 1,
                });
            }
        }

        self.updates
            .push(StagedUpdate::Failed(ids.to_vec(), error.to_string()));
        Ok(counts)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), OutboxError> {
        let state = self.store.state.clone();
        let mut state = state
            .lock()
            .map_err(|_| OutboxError::Internal("outbox state poisoned".to_string()))?;

        for update in std::mem::take(&mut self.updates) {
            match update {
                StagedUpdate::Processed(ids, at) => {
                    for id in ids {
                        if let Some(seq) = self.claimed_sequence(&id) {
                            if let Some(entry) = state.entries.get_mut(&seq) {
                                entry.processed_at = Some(at);
                            }
                        }
                    }
                }
                StagedUpdate::Failed(ids, error) => {
                    for id in ids {
                        if let Some(seq) = self.claimed_sequence(&id) {
                            if let Some(entry) = state.entries.get_mut(&seq) {
                                entry.retry_count += 1;
                                entry.last_error = Some(error.clone());
                            }
                        }
                    }
                }
            }
        }

        self.release(&mut state);
        Ok(())
    }
}

#[async_trait]
impl OutboxQueue for InMemoryOutboxStore {
    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let entries: Vec<OutboxEntry> = {
            let mut state = self.lock()?;
            let claimed: Vec<OutboxEntry> = state
                .entries
                .values()
                .filter(|e| e.processed_at.is_none() && e.retry_count < max_retries)
                .filter(|e| !state.locked.contains(&e.sequence_number))
                .take(limit)
                .cloned()
                .collect();
            for entry in &claimed {
                state.locked.insert(entry.sequence_number);
            }
            claimed
        };

        Ok(Box::new(InMemoryOutboxBatch {
            store: self.clone(),
            entries,
            updates: Vec::new(),
            released: false,
        }))
    }

    async fn stalled(&self, max_retries: i32) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.is_stalled(max_retries))
            .cloned()
            .collect())
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut state = self.lock()?;
        let before_len = state.entries.len();
        state
            .entries
            .retain(|_, e| !matches!(e.processed_at, Some(at) if at < before));
        Ok((before_len - state.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityRef;
    use serde_json::json;

    fn envelope(entity_id: &str, sequence: i64) -> EventEnvelope<serde_json::Value> {
        EventEnvelope::new(
            "trade.booked",
            "trade-capture",
            "tenant-1",
            EntityRef::new("trade", entity_id, sequence),
            json!({"sequence": sequence}),
        )
    }

    #[tokio::test]
    async fn test_rolled_back_append_is_never_claimed() {
        let store = InMemoryOutboxStore::new();

        let mut tx = store.begin();
        tx.append(&envelope("T-1", 1)).unwrap();
        tx.rollback();

        let batch = store.claim_batch(10, 5).await.unwrap();
        assert!(batch.entries().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin();
            tx.append(&envelope("T-1", 1)).unwrap();
        }
        assert!(store.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_appends_in_one_transaction_keep_order() {
        let store = InMemoryOutboxStore::new();
        let a = envelope("T-1", 1);
        let b = envelope("T-1", 2);

        let mut tx = store.begin();
        let seq_a = tx.append(&a).unwrap();
        let seq_b = tx.append(&b).unwrap();
        tx.commit().unwrap();

        assert!(seq_a < seq_b);
        let batch = store.claim_batch(10, 5).await.unwrap();
        let ids: Vec<Uuid> = batch.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.event_id, b.event_id]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_skip_locked_entries() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        for seq in 1..=4 {
            tx.append(&envelope("T-1", seq)).unwrap();
        }
        tx.commit().unwrap();

        let first = store.claim_batch(2, 5).await.unwrap();
        let second = store.claim_batch(10, 5).await.unwrap();

        let first_seqs: Vec<i64> = first.entries().iter().map(|e| e.entity_sequence).collect();
        let second_seqs: Vec<i64> = second.entries().iter().map(|e| e.entity_sequence).collect();
        assert_eq!(first_seqs, vec![1, 2]);
        assert_eq!(second_seqs, vec![3, 4]);

        drop(first);
        let third = store.claim_batch(10, 5).await.unwrap();
        assert_eq!(third.entries().len(), 2, "dropped claim releases its rows");
    }

    #[tokio::test]
    async fn test_updates_apply_only_on_commit() {
        let store = InMemoryOutboxStore::new();
        let e = envelope("T-1", 1);
        let mut tx = store.begin();
        tx.append(&e).unwrap();
        tx.commit().unwrap();

        let mut batch = store.claim_batch(10, 5).await.unwrap();
        batch.mark_processed(&[e.event_id], Utc::now()).await.unwrap();
        drop(batch);
        assert!(store.get(e.event_id).unwrap().unwrap().processed_at.is_none());

        let mut batch = store.claim_batch(10, 5).await.unwrap();
        batch.mark_processed(&[e.event_id], Utc::now()).await.unwrap();
        batch.commit().await.unwrap();
        assert!(store.get(e.event_id).unwrap().unwrap().processed_at.is_some());
    }

    #[tokio::test]
    async fn test_failures_count_towards_stall() {
        let store = InMemoryOutboxStore::new();
        let e = envelope("T-1", 1);
        let mut tx = store.begin();
        tx.append(&e).unwrap();
        tx.commit().unwrap();

        for expected in 1..=2 {
            let mut batch = store.claim_batch(10, 2).await.unwrap();
            let updates = batch.record_failure(&[e.event_id], "broker down").await.unwrap();
            assert_eq!(updates[0].retry_count, expected);
            batch.commit().await.unwrap();
        }

        let batch = store.claim_batch(10, 2).await.unwrap();
        assert!(batch.entries().is_empty(), "stalled entry is not selected");
        let stalled = store.stalled(2).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_processed_entries() {
        let store = InMemoryOutboxStore::new();
        let done = envelope("T-1", 1);
        let pending = envelope("T-1", 2);
        let mut tx = store.begin();
        tx.append(&done).unwrap();
        tx.append(&pending).unwrap();
        tx.commit().unwrap();

        let mut batch = store.claim_batch(1, 5).await.unwrap();
        batch
            .mark_processed(&[done.event_id], Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let purged = store
            .purge_processed(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(done.event_id).unwrap().is_none());
        assert!(store.get(pending.event_id).unwrap().is_some());
    }
}
