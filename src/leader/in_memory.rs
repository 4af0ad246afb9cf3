//! Process-local leader lock with lease expiry.

use super::LeaderLock;
use crate::error::OutboxResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: Uuid,
    expires_at: Instant,
}

/// Held lease; dropping it without `release` lets it lapse after the TTL
#[derive(Debug)]
pub struct LeaseGuard {
    key: i64,
    token: Uuid,
    holder: String,
}

impl LeaseGuard {
    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Shared lease table; clones contend for the same keys
#[derive(Debug, Clone)]
pub struct InMemoryLeaderLock {
    leases: Arc<Mutex<HashMap<i64, Lease>>>,
    lease_ttl: Duration,
}

impl InMemoryLeaderLock {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            lease_ttl,
        }
    }

    /// Current unexpired holder of `key`
    pub fn holder(&self, key: i64) -> Option<String> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(&key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone())
    }
}

impl Default for InMemoryLeaderLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaderLock {
    type Guard = LeaseGuard;

    async fn try_acquire(&self, key: i64, holder: &str) -> OutboxResult<Option<LeaseGuard>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(lease) = leases.get(&key) {
            if lease.expires_at > now {
                debug!(key, holder = %holder, current = %lease.holder, "Leader lease held elsewhere");
                return Ok(None);
            }
        }

        let token = Uuid::new_v4();
        leases.insert(
            key,
            Lease {
                holder: holder.to_string(),
                token,
                expires_at: now + self.lease_ttl,
            },
        );
        Ok(Some(LeaseGuard {
            key,
            token,
            holder: holder.to_string(),
        }))
    }

    async fn renew(&self, guard: &mut LeaseGuard) -> OutboxResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(&guard.key) {
            Some(lease) if lease.token == guard.token && lease.expires_at > now => {
                lease.expires_at = now + self.lease_ttl;
                Ok(true)
            }
            _ => {
                debug!(key = guard.key, holder = %guard.holder, "Leader lease lapsed");
                Ok(false)
            }
        }
    }

    async fn release(&self, guard: LeaseGuard) -> OutboxResult<()> {
        let mut leases = self.leases.lock();
        // A lapsed lease may already belong to someone else
        if leases
            .get(&guard.key)
            .map(|lease| lease.token == guard.token)
            .unwrap_or(false)
        {
            leases.remove(&guard.key);
        }
        Ok(())
    }
}
