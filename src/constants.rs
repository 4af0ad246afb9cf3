//! # Outbox Constants
//!
//! Fixed names and defaults shared by the stores, the relay and the consumers.

/// Defaults applied when configuration leaves a value unset
pub mod defaults {
    /// Leader-election key shared by every relay replica.
    /// Postgres advisory locks take a signed 64-bit key.
    pub const ADVISORY_LOCK_KEY: i64 = 7_300_114_001;

    /// Topic for event types without an explicit route
    pub const DEFAULT_TOPIC: &str = "integration-events";
}

/// Table and index names used by the Postgres-backed stores
pub mod tables {
    pub const OUTBOX_MESSAGES: &str = "outbox_messages";
    pub const INBOUND_DEDUPLICATION: &str = "inbound_deduplication";
    pub const SCHEMA_MIGRATIONS: &str = "outbox_schema_migrations";
}

/// Operation names used in structured logs and metric labels
pub mod operations {
    pub const ENQUEUE: &str = "enqueue";
    pub const CLAIM: &str = "claim";
    pub const PUBLISH: &str = "publish";
    pub const RECOVER: &str = "recover_stale";
    pub const REQUEUE: &str = "requeue";
    pub const DISPATCH: &str = "dispatch";
    pub const CONSUME: &str = "consume";
}

/// Status groupings for outbox messages
pub mod status_groups {
    use crate::state_machine::OutboxStatus;

    /// Statuses that never change again
    pub const TERMINAL: &[OutboxStatus] = &[OutboxStatus::Sent, OutboxStatus::Dead];

    /// Statuses still owed a delivery attempt
    pub const OUTSTANDING: &[OutboxStatus] = &[
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Failed,
    ];
}
