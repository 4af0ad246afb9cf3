//! # Outbox Error Types
//!
//! Structured error handling for the outbox pipeline using thiserror
//! instead of stringly-typed `Box<dyn Error>` results.
//!
//! Errors fall into four groups:
//! - **Duplicate enqueue**: a caller error surfaced synchronously so the
//!   caller's transaction rolls back
//! - **Storage**: database, transaction and row-mapping failures
//! - **Broker**: publish/consume failures (always retried, never surfaced to
//!   the enqueuing request)
//! - **Coordination**: leader lock and configuration failures

use crate::config::ConfigurationError;
use crate::messaging::BrokerError;
use thiserror::Error;
use uuid::Uuid;

/// Unique-violation SQLSTATE raised by Postgres
const UNIQUE_VIOLATION: &str = "23505";

/// Name of the partial unique index guarding `deduplication_key`
pub(crate) const DEDUP_INDEX_NAME: &str = "outbox_messages_deduplication_key_idx";

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Duplicate integration event: deduplication key '{deduplication_key}' already enqueued")]
    DuplicateEvent { deduplication_key: String },

    #[error("Outbox message not found: {id}")]
    MessageNotFound { id: Uuid },

    #[error("Invalid status transition for message {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Claim on message {id} no longer held by {holder}")]
    ClaimLost { id: Uuid, holder: String },

    #[error("Database error: {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Transaction already closed")]
    TransactionClosed,

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Leader lock error for key {key}: {message}")]
    LeaderLock { key: i64, message: String },

    #[error("Handler registration error: {message}")]
    Registration { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Internal outbox error: {message}")]
    Internal { message: String },
}

impl OutboxError {
    /// Create a duplicate event error
    pub fn duplicate_event(deduplication_key: impl Into<String>) -> Self {
        Self::DuplicateEvent {
            deduplication_key: deduplication_key.into(),
        }
    }

    /// Create a database error
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a leader lock error
    pub fn leader_lock(key: i64, message: impl Into<String>) -> Self {
        Self::LeaderLock {
            key,
            message: message.into(),
        }
    }

    /// Create a handler registration error
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is the duplicate-enqueue caller error
    pub fn is_duplicate_event(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }

    /// Map a sqlx error raised while inserting an outbox row.
    ///
    /// A unique violation on the deduplication index becomes `DuplicateEvent`.
    pub(crate) fn from_insert_error(err: sqlx::Error, deduplication_key: Option<&str>) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let is_unique = db_err.code().as_deref() == Some(UNIQUE_VIOLATION);
            let on_dedup_index = db_err
                .constraint()
                .map(|c| c == DEDUP_INDEX_NAME)
                .unwrap_or(true);
            if is_unique && on_dedup_index {
                if let Some(key) = deduplication_key {
                    return Self::duplicate_event(key);
                }
            }
        }
        err.into()
    }
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OutboxError::database("query", "No rows found"),
            sqlx::Error::Database(db_err) => OutboxError::database("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => OutboxError::timeout("database_pool", 30),
            sqlx::Error::PoolClosed => OutboxError::database("pool", "Database pool is closed"),
            _ => OutboxError::database("connection", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::serialization(err.to_string())
    }
}

/// Result type alias for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;
