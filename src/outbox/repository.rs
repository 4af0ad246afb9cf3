//! # Outbox Repository
//!
//! Relay-side access to the outbox table. Every mutation is a guarded
//! status transition: rows that are not in the expected status are left
//! untouched and reported as conflicts.

use crate::error::OutboxResult;
use crate::models::OutboxMessage;
use crate::state_machine::OutboxStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Row counts per status, for operational inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Processing => self.processing += count,
            OutboxStatus::Sent => self.sent += count,
            OutboxStatus::Failed => self.failed += count,
            OutboxStatus::Dead => self.dead += count,
        }
    }

    /// Messages that have not reached a terminal status
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing + self.failed
    }

    pub fn total(&self) -> u64 {
        self.outstanding() + self.sent + self.dead
    }
}

/// Storage operations used by the relay and the retry sweep
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Atomically flip up to `batch_size` pending rows, oldest first, to processing
    async fn claim_batch(
        &self,
        holder: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxMessage>>;

    /// Refresh the claim timestamp of a row still held by `holder`.
    ///
    /// Returns `false` when the row was recovered or claimed by someone
    /// else; the caller must not publish it.
    async fn touch_claim(&self, id: Uuid, holder: &str, now: DateTime<Utc>) -> OutboxResult<bool>;

    /// Processing -> Sent, counting the successful attempt.
    ///
    /// Fails with `ClaimLost` when the row is no longer claimed by `holder`.
    async fn mark_sent(
        &self,
        id: Uuid,
        holder: &str,
        processed_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Processing -> Failed with the next retry time
    async fn mark_failed(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Processing (held by `holder`) | Failed -> Dead
    async fn mark_dead(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> OutboxResult<()>;

    /// Hand rows claimed by `holder` back to pending without counting an attempt
    async fn release_claims(&self, holder: &str, ids: &[Uuid]) -> OutboxResult<u64>;

    /// Reset processing rows claimed before `cutoff` back to pending
    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64>;

    /// Flip up to `limit` failed rows whose backoff elapsed back to pending
    async fn requeue_due(&self, now: DateTime<Utc>, limit: u32) -> OutboxResult<u64>;

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxMessage>>;

    async fn status_counts(&self) -> OutboxResult<StatusCounts>;
}
