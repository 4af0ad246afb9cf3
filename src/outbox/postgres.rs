//! # Postgres Outbox Store
//!
//! The outbox table lives next to the domain tables so that enqueueing can
//! share the caller's transaction. Claims use `FOR UPDATE SKIP LOCKED`, so
//! even overlapping relays never hand the same row out twice.

use super::repository::{OutboxRepository, StatusCounts};
use super::writer::OutboxWriter;
use crate::error::{OutboxError, OutboxResult};
use crate::models::{NewOutboxMessage, OutboxMessage};
use crate::state_machine::OutboxStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

const RETURNING_COLUMNS: &str = "id, message_type, payload_json, routing_key, deduplication_key, \
     created_at, processed_at, attempts, status, last_error, next_attempt_at, claimed_at, claimed_by";

/// Raw `outbox_messages` row
#[derive(Debug, Clone, FromRow)]
pub(crate) struct OutboxRow {
    pub id: Uuid,
    pub message_type: String,
    pub payload_json: String,
    pub routing_key: Option<String>,
    pub deduplication_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub status: String,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxError::database("decode_status", e))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            OutboxError::database(
                "decode_attempts",
                format!("negative attempts {} on {}", row.attempts, row.id),
            )
        })?;

        Ok(OutboxMessage {
            id: row.id,
            message_type: row.message_type,
            payload_json: row.payload_json,
            routing_key: row.routing_key,
            deduplication_key: row.deduplication_key,
            created_at: row.created_at,
            processed_at: row.processed_at,
            attempts,
            status,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by,
        })
    }
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Insert one pending row on any Postgres executor
async fn insert_message<'e, E>(executor: E, message: &NewOutboxMessage) -> OutboxResult<Uuid>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO outbox_messages
            (id, message_type, payload_json, routing_key, deduplication_key, status, attempts)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0)
        "#,
    )
    .bind(message.id)
    .bind(&message.message_type)
    .bind(&message.payload_json)
    .bind(&message.routing_key)
    .bind(&message.deduplication_key)
    .execute(executor)
    .await
    .map_err(|e| OutboxError::from_insert_error(e, message.deduplication_key.as_deref()))?;

    Ok(message.id)
}

/// Enqueue inside the caller's transaction. A duplicate key aborts the
/// Postgres transaction, so the caller must roll back.
#[async_trait]
impl<'c> OutboxWriter for Transaction<'c, Postgres> {
    async fn enqueue(&mut self, message: NewOutboxMessage) -> OutboxResult<Uuid> {
        let id = insert_message(&mut **self, &message).await?;
        debug!(
            message_id = %id,
            message_type = %message.message_type,
            "Outbox message staged in transaction"
        );
        Ok(id)
    }
}

/// Relay-side outbox store backed by a connection pool
#[derive(Debug, Clone)]
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

    /// Open a transaction for domain writes plus enqueue
    pub async fn begin(&self) -> OutboxResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Explain a guarded update that matched no row
    async fn transition_conflict(&self, id: Uuid, holder: &str, to: OutboxStatus) -> OutboxError {
        match self.find(id).await {
            Ok(Some(message))
                if message.status == OutboxStatus::Processing
                    && message.claimed_by.as_deref() != Some(holder) =>
            {
                OutboxError::ClaimLost {
                    id,
                    holder: holder.to_string(),
                }
            }
            Ok(Some(message)) => OutboxError::InvalidTransition {
                id,
                from: message.status.to_string(),
                to: to.to_string(),
            },
            Ok(None) => OutboxError::MessageNotFound { id },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxStore {
    async fn claim_batch(
        &self,
        holder: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET status = 'processing', claimed_at = $2, claimed_by = $3
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RETURNING_COLUMNS}
            "#
        );

        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(i64::from(batch_size))
            .bind(now)
            .bind(holder)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<OutboxResult<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(messages)
    }

    async fn touch_claim(&self, id: Uuid, holder: &str, now: DateTime<Utc>) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET claimed_at = $3
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        holder: &str,
        processed_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'sent', processed_at = $3, attempts = attempts + 1,
                next_attempt_at = NULL, claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, holder, OutboxStatus::Sent).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', attempts = $3, last_error = $4, next_attempt_at = $5,
                claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(attempts_param(attempts))
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, holder, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'dead', attempts = $3, last_error = $4, next_attempt_at = NULL,
                claimed_at = NULL, claimed_by = NULL
            WHERE id = $1
              AND ((status = 'processing' AND claimed_by = $2) OR status = 'failed')
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(attempts_param(attempts))
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, holder, OutboxStatus::Dead).await);
        }
        Ok(())
    }

    async fn release_claims(&self, holder: &str, ids: &[Uuid]) -> OutboxResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', claimed_at = NULL, claimed_by = NULL
            WHERE id = ANY($1) AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(ids.to_vec())
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', claimed_at = NULL, claimed_by = NULL
            WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_due(&self, now: DateTime<Utc>, limit: u32) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', next_attempt_at = NULL
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                ORDER BY next_attempt_at NULLS FIRST, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxMessage>> {
        let sql = format!("SELECT {RETURNING_COLUMNS} FROM outbox_messages WHERE id = $1");
        let row: Option<OutboxRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxMessage::try_from).transpose()
    }

    async fn status_counts(&self) -> OutboxResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status = status
                .parse::<OutboxStatus>()
                .map_err(|e| OutboxError::database("decode_status", e))?;
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, attempts: i32) -> OutboxRow {
        OutboxRow {
            id: Uuid::new_v4(),
            message_type: "TaskCreated".to_string(),
            payload_json: "{}".to_string(),
            routing_key: None,
            deduplication_key: Some("task-1-created".to_string()),
            created_at: Utc::now(),
            processed_at: None,
            attempts,
            status: status.to_string(),
            last_error: None,
            next_attempt_at: None,
            claimed_at: None,
            claimed_by: None,
        }
    }

    #[test]
    fn test_row_mapping() {
        let message = OutboxMessage::try_from(row("failed", 2)).unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, 2);
        assert_eq!(message.deduplication_key.as_deref(), Some("task-1-created"));
    }

    #[test]
    fn test_row_mapping_rejects_bad_values() {
        assert!(OutboxMessage::try_from(row("exploded", 0)).is_err());
        assert!(OutboxMessage::try_from(row("pending", -1)).is_err());
    }

    #[test]
    fn test_attempts_param_saturates() {
        assert_eq!(attempts_param(3), 3);
        assert_eq!(attempts_param(u32::MAX), i32::MAX);
    }
}
