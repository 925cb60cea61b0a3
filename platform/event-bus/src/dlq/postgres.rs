use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    DeadLetterFilter, DeadLetterPayload, DeadLetterRecord, DeadLetterSink, DlqError,
    NewDeadLetter,
};

const RECORD_COLUMNS: &str = r#"
    id, original_topic, partition_key, original_offset, envelope, raw_payload,
    error, stack_context, first_failed_at, attempt_count, recorded_at, resolved_at
"#;

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    original_topic: String,
    partition_key: String,
    original_offset: String,
    envelope: Option<JsonValue>,
    raw_payload: Option<Vec<u8>>,
    error: String,
    stack_context: String,
    first_failed_at: DateTime<Utc>,
    attempt_count: i32,
    recorded_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = DlqError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let payload = match (row.envelope, row.raw_payload) {
            (Some(envelope), _) => DeadLetterPayload::Envelope(serde_json::from_value(envelope)?),
            (None, Some(raw)) => DeadLetterPayload::Raw(raw),
            (None, None) => {
                return Err(DlqError::Internal(format!(
                    "dead letter {} has no payload",
                    row.id
                )))
            }
        };

        Ok(Self {
            id: row.id,
            original_topic: row.original_topic,
            partition_key: row.partition_key,
            original_offset: row.original_offset,
            payload,
            error: row.error,
            stack_context: row.stack_context,
            first_failed_at: row.first_failed_at,
            attempt_count: row.attempt_count,
            recorded_at: row.recorded_at,
            resolved_at: row.resolved_at,
        })
    }
}

/// PostgreSQL dead-letter sink (`dead_letter_records` table)
#[derive(Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn record(&self, dead_letter: NewDeadLetter) -> Result<Uuid, DlqError> {
        let id = Uuid::new_v4();
        let (envelope, raw_payload) = match &dead_letter.payload {
            DeadLetterPayload::Envelope(envelope) => (Some(serde_json::to_value(envelope)?), None),
            DeadLetterPayload::Raw(bytes) => (None, Some(bytes.clone())),
        };

        sqlx::query(
            r#"
            INSERT INTO dead_letter_records (
                id, original_topic, partition_key, original_offset, envelope,
                raw_payload, error, stack_context, first_failed_at, attempt_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&dead_letter.original_topic)
        .bind(&dead_letter.partition_key)
        .bind(&dead_letter.original_offset)
        .bind(envelope)
        .bind(raw_payload)
        .bind(&dead_letter.error)
        .bind(&dead_letter.stack_context)
        .bind(dead_letter.first_failed_at)
        .bind(dead_letter.attempt_count)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            dead_letter_id = %id,
            topic = %dead_letter.original_topic,
            partition_key = %dead_letter.partition_key,
            offset = %dead_letter.original_offset,
            attempts = dead_letter.attempt_count,
            error = %dead_letter.error,
            "Message recorded in dead-letter sink"
        );

        Ok(id)
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, DlqError> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM dead_letter_records
            WHERE ($1::text IS NULL OR original_topic = $1)
              AND ($2::timestamptz IS NULL OR first_failed_at >= $2)
              AND ($3::timestamptz IS NULL OR first_failed_at < $3)
              AND ($4 OR resolved_at IS NULL)
            ORDER BY first_failed_at ASC, recorded_at ASC
            LIMIT $5
            "#
        ))
        .bind(filter.topic.as_deref())
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.include_resolved)
        .bind(filter.limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DlqError> {
        let row = sqlx::query_as::<_, DeadLetterRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM dead_letter_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeadLetterRecord::try_from).transpose()
    }

    async fn mark_resolved(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<(), DlqError> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_records
            SET resolved_at = $2
            WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(resolved_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM dead_letter_records WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Err(DlqError::AlreadyResolved(id)),
            None => Err(DlqError::NotFound(id)),
        }
    }
}
