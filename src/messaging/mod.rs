//! # Messaging Module
//!
//! Broker boundary for the outbox pipeline: publish/consume traits, the
//! wire envelope, topic routing and an in-process broker.

pub mod broker;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod topics;

pub use broker::{BrokerConsumer, BrokerPublisher, Delivery, DeliveryHandle};
pub use errors::{BrokerError, BrokerResult};
pub use in_memory::{InMemoryBroker, PublishedRecord};
pub use message::BrokerEnvelope;
pub use topics::TopicRouter;
