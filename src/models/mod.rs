//! # Models
//!
//! Data carried through the outbox pipeline.

pub mod integration_event;
pub mod outbox_message;

pub use integration_event::IntegrationEvent;
pub use outbox_message::{NewOutboxMessage, OutboxMessage};
