//! # Consumer Module
//!
//! Inbound side of the pipeline: deduplication stores and the per-topic
//! consumer loop that feeds the dispatcher.

pub mod dedup;
pub mod inbound;
pub mod postgres;

pub use dedup::{
    DedupState, DeduplicationRecord, DeduplicationStore, InMemoryDeduplicationStore,
    ReserveOutcome,
};
pub use inbound::{ConsumeOutcome, ConsumerStats, ConsumerStatsSnapshot, InboundConsumer};
pub use postgres::PgDeduplicationStore;
