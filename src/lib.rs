#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Outbox Core
//!
//! Transactional outbox and integration-event delivery for the project
//! management platform.
//!
//! ## Overview
//!
//! Domain operations (creating a task, posting a chat message, moving a list)
//! must notify other services without a distributed transaction. This crate
//! turns each notification into an outbox row written in the same database
//! transaction as the domain change, then relays those rows to the message
//! broker with at-least-once semantics, and deduplicates them again on the
//! consuming side so handlers run once per event.
//!
//! ## Data Flow
//!
//! ```text
//! domain tx ──► outbox_messages (pending)
//!                    │
//!       OutboxRelay (leader-guarded, FIFO batches)
//!                    │ publish
//!                    ▼
//!                 broker ──► InboundConsumer ──► dedup guard ──► dispatcher ──► handler
//!                    ▲
//!        RetrySweep requeues failed rows after backoff
//! ```
//!
//! ## Module Organization
//!
//! - [`outbox`] - Enqueue boundary and outbox storage (in-memory and Postgres)
//! - [`relay`] - Outbox relay, retry scheduler and retry sweep
//! - [`leader`] - Lease-based leader election for the relay
//! - [`messaging`] - Broker traits, wire envelope, topic routing, in-memory broker
//! - [`dispatch`] - Integration event handler registry and dispatcher
//! - [`consumer`] - Inbound consumer and deduplication stores
//! - [`pipeline`] - Supervision of the background services
//! - [`events`] - In-process domain event broadcast
//! - [`state_machine`] - Outbox message lifecycle
//! - [`config`] - Layered configuration
//! - [`database`] - Connection pooling and embedded migrations
//!
//! ## Quick Start
//!
//! ```rust
//! use outbox_core::models::{IntegrationEvent, NewOutboxMessage};
//! use outbox_core::outbox::{InMemoryOutboxStore, OutboxWriter};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryOutboxStore::new();
//!
//! let mut uow = store.begin();
//! let event = IntegrationEvent::new(json!({"task_id": "123", "name": "Write docs"}));
//! let message = NewOutboxMessage::from_event("TaskCreated", &event)?
//!     .with_deduplication_key("task-123-created");
//! uow.enqueue(message).await?;
//! uow.commit()?;
//!
//! assert_eq!(store.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod consumer;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod leader;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod outbox;
pub mod pipeline;
pub mod relay;
pub mod state_machine;

pub use config::{ConfigManager, OutboxConfig};
pub use consumer::{DeduplicationStore, InMemoryDeduplicationStore, InboundConsumer};
pub use dispatch::{
    IntegrationEventDispatcher, IntegrationEventHandler, IntegrationEventHandlingResult,
    IntegrationEventRegistry,
};
pub use error::{OutboxError, OutboxResult};
pub use leader::{InMemoryLeaderLock, LeaderLock, PgAdvisoryLeaderLock};
pub use messaging::{BrokerConsumer, BrokerEnvelope, BrokerPublisher, InMemoryBroker};
pub use models::{IntegrationEvent, NewOutboxMessage, OutboxMessage};
pub use outbox::{InMemoryOutboxStore, OutboxRepository, OutboxWriter, PgOutboxStore};
pub use pipeline::{OutboxPipeline, PipelineComponents};
pub use relay::{OutboxRelay, RelayCycleOutcome, RetryScheduler};
pub use state_machine::OutboxStatus;
