//! Postgres-backed deduplication store on the `inbound_deduplication` table.

use super::dedup::{DedupState, DeduplicationRecord, DeduplicationStore, ReserveOutcome};
use crate::error::{OutboxError, OutboxResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

#[derive(Debug, Clone, FromRow)]
struct DedupRow {
    deduplication_key: String,
    state: String,
    reserved_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DedupRow> for DeduplicationRecord {
    type Error = OutboxError;

    fn try_from(row: DedupRow) -> Result<Self, Self::Error> {
        Ok(DeduplicationRecord {
            state: row
                .state
                .parse::<DedupState>()
                .map_err(|e| OutboxError::database("decode_dedup_state", e))?,
            deduplication_key: row.deduplication_key,
            reserved_at: row.reserved_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgDeduplicationStore {
    pool: PgPool,
    reservation_timeout: chrono::Duration,
}

impl PgDeduplicationStore {
    pub fn new(pool: PgPool, reservation_timeout: Duration) -> Self {
        Self {
            pool,
            reservation_timeout: chrono::Duration::from_std(reservation_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }
}

#[async_trait]
impl DeduplicationStore for PgDeduplicationStore {
    async fn try_reserve(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<ReserveOutcome> {
        let takeover_cutoff = now
            .checked_sub_signed(self.reservation_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        // Inserts a fresh reservation, or takes over an abandoned one
        let reserved: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO inbound_deduplication (deduplication_key, state, reserved_at)
            VALUES ($1, 'in_flight', $2)
            ON CONFLICT (deduplication_key) DO UPDATE
                SET state = 'in_flight', reserved_at = EXCLUDED.reserved_at, processed_at = NULL
                WHERE inbound_deduplication.state = 'in_flight'
                  AND inbound_deduplication.reserved_at < $3
            RETURNING deduplication_key
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(takeover_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        if reserved.is_some() {
            return Ok(ReserveOutcome::Reserved);
        }

        match self.get(key).await? {
            Some(record) if record.state == DedupState::Processed => {
                Ok(ReserveOutcome::AlreadyProcessed)
            }
            Some(_) => Ok(ReserveOutcome::InFlight),
            // Pruned between the two statements; the next delivery retries
            None => Ok(ReserveOutcome::InFlight),
        }
    }

    async fn mark_processed(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inbound_deduplication (deduplication_key, state, reserved_at, processed_at)
            VALUES ($1, 'processed', $2, $2)
            ON CONFLICT (deduplication_key) DO UPDATE
                SET state = 'processed', processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> OutboxResult<()> {
        sqlx::query(
            "DELETE FROM inbound_deduplication WHERE deduplication_key = $1 AND state = 'in_flight'",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbound_deduplication
            WHERE COALESCE(processed_at, reserved_at) < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, key: &str) -> OutboxResult<Option<DeduplicationRecord>> {
        let row: Option<DedupRow> = sqlx::query_as(
            r#"
            SELECT deduplication_key, state, reserved_at, processed_at
            FROM inbound_deduplication
            WHERE deduplication_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeduplicationRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_mapping() {
        let now = Utc::now();
        let record = DeduplicationRecord::try_from(DedupRow {
            deduplication_key: "task-1".to_string(),
            state: "processed".to_string(),
            reserved_at: now,
            processed_at: Some(now),
        })
        .unwrap();
        assert_eq!(record.state, DedupState::Processed);

        let bad = DeduplicationRecord::try_from(DedupRow {
            deduplication_key: "task-1".to_string(),
            state: "unknown".to_string(),
            reserved_at: now,
            processed_at: None,
        });
        assert!(bad.is_err());
    }
}
