//! # Domain Events
//!
//! In-process broadcast of domain state changes. This is deliberately a
//! separate interface from integration events: domain events are not
//! persisted and are never turned into outbox rows automatically. Callers
//! that need durable delivery enqueue an integration event explicitly.

pub mod publisher;

pub use publisher::{DomainEvent, DomainEventPublisher, PublishError};
