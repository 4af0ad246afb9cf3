//! Postgres session advisory lock.
//!
//! The guard pins the pool connection that owns the lock. If the guard is
//! dropped without an explicit release, the connection is detached from the
//! pool and closed, which ends the session and frees the lock.

use super::LeaderLock;
use crate::error::{OutboxError, OutboxResult};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct PgAdvisoryGuard {
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl PgAdvisoryGuard {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for PgAdvisoryGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "Advisory guard dropped while held, closing its session");
            drop(conn.detach());
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgAdvisoryLeaderLock {
    pool: PgPool,
}

impl PgAdvisoryLeaderLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaderLock for PgAdvisoryLeaderLock {
    type Guard = PgAdvisoryGuard;

    async fn try_acquire(&self, key: i64, holder: &str) -> OutboxResult<Option<PgAdvisoryGuard>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| OutboxError::leader_lock(key, e.to_string()))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| OutboxError::leader_lock(key, e.to_string()))?;

        if !acquired {
            debug!(key, holder = %holder, "Advisory lock held by another session");
            return Ok(None);
        }

        Ok(Some(PgAdvisoryGuard {
            key,
            conn: Some(conn),
        }))
    }

    async fn renew(&self, guard: &mut PgAdvisoryGuard) -> OutboxResult<bool> {
        let key = guard.key;
        let Some(conn) = guard.conn.as_mut() else {
            return Ok(false);
        };

        // Session locks live as long as the session; confirm it still holds this one
        let held = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND pid = pg_backend_pid()
                  AND granted
                  AND objsubid = 1
                  AND ((classid::bigint << 32) | objid::bigint) = $1
            )
            "#,
        )
        .bind(key)
        .fetch_one(&mut **conn)
        .await;

        match held {
            Ok(held) => Ok(held),
            Err(e) => {
                warn!(key, error = %e, "Advisory lock session check failed, giving up leadership");
                if let Some(conn) = guard.conn.take() {
                    drop(conn.detach());
                }
                Ok(false)
            }
        }
    }

    async fn release(&self, mut guard: PgAdvisoryGuard) -> OutboxResult<()> {
        let key = guard.key;
        let Some(mut conn) = guard.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                drop(conn.detach());
                Err(OutboxError::leader_lock(key, "lock was not held by this session"))
            }
            Err(e) => {
                // Closing the session is the only safe way to drop the lock now
                drop(conn.detach());
                Err(OutboxError::leader_lock(key, e.to_string()))
            }
        }
    }
}
