//! # Database Operations
//!
//! Connection pooling and the embedded schema migrations for the
//! Postgres-backed outbox and deduplication stores.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use outbox_core::config::DatabaseConfig;
//! use outbox_core::database::{DatabaseConnection, DatabaseMigrations};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! DatabaseMigrations::run_all(db.pool()).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::{DatabaseMigrations, Migration};
