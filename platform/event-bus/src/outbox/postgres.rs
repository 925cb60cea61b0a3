use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{FailureUpdate, NewOutboxEntry, OutboxBatch, OutboxEntry, OutboxError, OutboxQueue};
use crate::EventEnvelope;

const ENTRY_COLUMNS: &str = r#"
    id, sequence_number, event_type, event_version, occurred_at, producer,
    tenant_id, correlation_id, causation_id, entity_type, entity_id,
    entity_sequence, payload, created_at, processed_at, retry_count, last_error
"#;

/// PostgreSQL outbox (`events_outbox` table)
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append an event to the outbox inside the caller's transaction
    ///
    /// Call this with the same transaction that writes the domain rows. The
    /// store does not deduplicate; appending the same envelope twice fails on
    /// the primary key.
    ///
    /// Returns the store-assigned `sequence_number`.
    pub async fn append<T: Serialize>(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope<T>,
    ) -> Result<i64, OutboxError> {
        let entry = NewOutboxEntry::from_envelope(envelope)?;

        let sequence_number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events_outbox (
                id, event_type, event_version, occurred_at, producer, tenant_id,
                correlation_id, causation_id, entity_type, entity_id,
                entity_sequence, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING sequence_number
            "#,
        )
        .bind(entry.id)
        .bind(&entry.event_type)
        .bind(entry.event_version)
        .bind(entry.occurred_at)
        .bind(&entry.producer)
        .bind(&entry.tenant_id)
        .bind(&entry.correlation_id)
        .bind(&entry.causation_id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.entity_sequence)
        .bind(&entry.payload)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!(
            event_id = %entry.id,
            event_type = %entry.event_type,
            sequence_number = sequence_number,
            "Event appended to outbox"
        );

        Ok(sequence_number)
    }
}

/// A claim held open as a database transaction
struct PgOutboxBatch {
    tx: Transaction<'static, Postgres>,
    entries: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxBatch for PgOutboxBatch {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_processed(
        &mut self,
        ids: &[Uuid],
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET processed_at = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(processed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn record_failure(
        &mut self,
        ids: &[Uuid],
        error: &str,
    ) -> Result<Vec<FailureUpdate>, OutboxError> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE events_outbox
            SET retry_count = retry_count + 1,
                last_error = $2
            WHERE id = ANY($1)
            RETURNING id, retry_count
            "#,
        )
        .bind(ids)
        .bind(error)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, retry_count)| FailureUpdate { id, retry_count })
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxQueue for PgOutboxStore {
    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError> {
        let mut tx = self.pool.begin().await?;

        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM events_outbox
            WHERE processed_at IS NULL
              AND retry_count < $2
            ORDER BY sequence_number ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .bind(max_retries)
        .fetch_all(&mut *tx)
        .await?;

        Ok(Box::new(PgOutboxBatch { tx, entries }))
    }

    async fn stalled(&self, max_retries: i32) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM events_outbox
            WHERE processed_at IS NULL
              AND retry_count >= $1
            ORDER BY sequence_number ASC
            "#
        ))
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM events_outbox
            WHERE processed_at IS NOT NULL
              AND processed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
