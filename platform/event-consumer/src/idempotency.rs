//! Handler-side idempotency keyed on `(entityType, entityId, sequence)`
//!
//! The runtime delivers at least once and does not deduplicate. A handler
//! that must not apply an event twice calls `apply_once` inside the same
//! transaction as its own writes and skips the work on
//! [`SequenceCheck::AlreadyApplied`].
//!
//! Every applied sequence is recorded, not just the highest one. A dead
//! letter replayed after later sequences of the same entity went through is
//! still applied.

use event_bus::EntityRef;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First time this sequence is seen; it is now recorded
    Applied,
    /// This entity sequence was applied before, by the given event
    AlreadyApplied { event_id: Uuid },
}

impl SequenceCheck {
    pub fn is_applied(&self) -> bool {
        matches!(self, SequenceCheck::Applied)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Persisted guard over `consumer_applied_sequences`
#[derive(Debug, Clone)]
pub struct SequenceGuard {
    consumer: String,
}

impl SequenceGuard {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }

    /// Record `entity.sequence` unless this consumer already applied it
    ///
    /// Runs in the caller's transaction: a rolled-back handler leaves no trace.
    pub async fn apply_once(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity: &EntityRef,
        event_id: Uuid,
    ) -> Result<SequenceCheck, GuardError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO consumer_applied_sequences
                (consumer, entity_type, entity_id, sequence, event_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (consumer, entity_type, entity_id, sequence) DO NOTHING
            RETURNING sequence
            "#,
        )
        .bind(&self.consumer)
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(entity.sequence)
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await?;

        if inserted.is_some() {
            return Ok(SequenceCheck::Applied);
        }

        let applied_by: Uuid = sqlx::query_scalar(
            r#"
            SELECT event_id FROM consumer_applied_sequences
            WHERE consumer = $1 AND entity_type = $2 AND entity_id = $3 AND sequence = $4
            "#,
        )
        .bind(&self.consumer)
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(entity.sequence)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!(
            consumer = %self.consumer,
            entity_id = %entity.entity_id,
            sequence = entity.sequence,
            applied_by = %applied_by,
            "Skipping already-applied entity sequence"
        );

        Ok(SequenceCheck::AlreadyApplied {
            event_id: applied_by,
        })
    }
}

/// Guard kept in process memory, for tests and dev runs
#[derive(Debug, Clone, Default)]
pub struct InMemorySequenceGuard {
    applied: Arc<Mutex<HashMap<(String, String, i64), Uuid>>>,
}

impl InMemorySequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_once(
        &self,
        entity: &EntityRef,
        event_id: Uuid,
    ) -> Result<SequenceCheck, GuardError> {
        let mut applied = self
            .applied
            .lock()
            .map_err(|e| GuardError::Internal(format!("sequence guard lock poisoned: {}", e)))?;

        let key = (
            entity.entity_type.clone(),
            entity.entity_id.clone(),
            entity.sequence,
        );
        match applied.get(&key) {
            Some(applied_by) => Ok(SequenceCheck::AlreadyApplied {
                event_id: *applied_by,
            }),
            None => {
                applied.insert(key, event_id);
                Ok(SequenceCheck::Applied)
            }
        }
    }

    /// Sequences applied for one entity, ascending
    pub fn applied_sequences(&self, entity_type: &str, entity_id: &str) -> Vec<i64> {
        let applied = match self.applied.lock() {
            Ok(applied) => applied,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut sequences: Vec<i64> = applied
            .keys()
            .filter(|(t, id, _)| t == entity_type && id == entity_id)
            .map(|(_, _, sequence)| *sequence)
            .collect();
        sequences.sort_unstable();
        sequences
    }
}
