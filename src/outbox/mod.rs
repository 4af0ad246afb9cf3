//! # Outbox Storage
//!
//! Durable storage of integration-event intents. Writers stage rows inside
//! the caller's unit of work; the repository is the relay's view of the
//! same table.

pub mod in_memory;
pub mod postgres;
pub mod repository;
pub mod writer;

pub use in_memory::{InMemoryOutboxStore, InMemoryUnitOfWork};
pub use postgres::PgOutboxStore;
pub use repository::{OutboxRepository, StatusCounts};
pub use writer::OutboxWriter;
