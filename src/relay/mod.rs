//! # Relay Module
//!
//! Relay-side delivery: the leader-guarded outbox relay, the retry
//! scheduler that prices failed attempts, and the sweep that requeues them.

pub mod outbox_relay;
pub mod retry;
pub mod retry_sweep;

pub use outbox_relay::{
    OutboxRelay, RelayCycleOutcome, RelayCycleSummary, RelayStats, RelayStatsSnapshot,
};
pub use retry::{RetryDecision, RetryScheduler};
pub use retry_sweep::RetrySweep;
