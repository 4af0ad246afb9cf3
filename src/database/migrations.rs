//! # Database Migration System
//!
//! The outbox schema ships inside the crate as embedded SQL. Migrations run
//! in version order under a Postgres advisory lock, so replicas starting
//! together apply each migration exactly once.
//!
//! ```sql
//! -- One replica holds the lock while applying
//! SELECT pg_advisory_lock(7300114002)
//! ```

use crate::constants::tables;
use crate::error::{OutboxError, OutboxResult};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::HashSet;
use tracing::{debug, info};

/// Serializes migration runs across replicas
const MIGRATION_LOCK_KEY: i64 = 7_300_114_002;

/// One embedded migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS)
    pub version: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "20250301000001",
        name: "create outbox messages",
        sql: include_str!("../../migrations/20250301000001_create_outbox_messages.sql"),
    },
    Migration {
        version: "20250301000002",
        name: "create inbound deduplication",
        sql: include_str!("../../migrations/20250301000002_create_inbound_deduplication.sql"),
    },
];

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Embedded migrations in apply order
    pub fn all() -> &'static [Migration] {
        MIGRATIONS
    }

    /// Apply every outstanding migration; returns the versions applied
    pub async fn run_all(pool: &PgPool) -> OutboxResult<Vec<&'static str>> {
        // Session advisory locks belong to a connection, not to the pool
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(|e| OutboxError::leader_lock(MIGRATION_LOCK_KEY, e.to_string()))?;

        let result = Self::run_outstanding(&mut conn).await;

        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if unlocked.is_err() {
            drop(conn.detach());
        }

        result
    }

    async fn run_outstanding(
        conn: &mut PoolConnection<Postgres>,
    ) -> OutboxResult<Vec<&'static str>> {
        Self::ensure_migration_table(conn).await?;
        let applied = Self::applied_versions(conn).await?;

        let mut newly_applied = Vec::new();
        for migration in Self::pending(&applied) {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying outbox migration"
            );

            let mut tx = sqlx::Connection::begin(&mut **conn).await?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    OutboxError::database(format!("migration {}", migration.version), e.to_string())
                })?;
            sqlx::query(&format!(
                "INSERT INTO {} (version) VALUES ($1)",
                tables::SCHEMA_MIGRATIONS
            ))
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("Outbox schema up to date");
        }
        Ok(newly_applied)
    }

    fn pending(applied: &HashSet<String>) -> impl Iterator<Item = &'static Migration> + '_ {
        MIGRATIONS
            .iter()
            .filter(move |migration| !applied.contains(migration.version))
    }

    async fn ensure_migration_table(conn: &mut PoolConnection<Postgres>) -> OutboxResult<()> {
        sqlx::raw_sql(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            tables::SCHEMA_MIGRATIONS
        ))
        .execute(&mut **conn)
        .await?;
        Ok(())
    }

    async fn applied_versions(conn: &mut PoolConnection<Postgres>) -> OutboxResult<HashSet<String>> {
        let versions: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT version FROM {}",
            tables::SCHEMA_MIGRATIONS
        ))
        .fetch_all(&mut **conn)
        .await?;
        Ok(versions.into_iter().collect())
    }
}
