//! # Leader Election
//!
//! At most one relay instance processes a cycle at a time. Leadership is a
//! lease: if the holder dies, the lock lapses (session end for Postgres
//! advisory locks, TTL expiry for the in-memory lock) and another instance
//! takes over on its next cycle.

pub mod advisory;
pub mod in_memory;

pub use advisory::{PgAdvisoryGuard, PgAdvisoryLeaderLock};
pub use in_memory::{InMemoryLeaderLock, LeaseGuard};

use crate::error::OutboxResult;
use async_trait::async_trait;

/// Cluster-wide mutual exclusion keyed by an integer lock key
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Proof of leadership; releasing consumes it
    type Guard: Send;

    /// Try to become leader without waiting; `None` when another holder has it
    async fn try_acquire(&self, key: i64, holder: &str) -> OutboxResult<Option<Self::Guard>>;

    /// Confirm the guard still confers leadership, extending its lease.
    ///
    /// `false` means leadership lapsed and another instance may already
    /// hold the lock.
    async fn renew(&self, guard: &mut Self::Guard) -> OutboxResult<bool>;

    async fn release(&self, guard: Self::Guard) -> OutboxResult<()>;
}
