//! # Broker Boundary
//!
//! The message broker is an opaque external service. The pipeline only
//! needs to publish bytes to a topic and to pull deliveries that are later
//! acknowledged or handed back for redelivery.

use super::errors::BrokerResult;
use async_trait::async_trait;

/// Publish side of the broker
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish one payload; `Ok` means the broker acknowledged it
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()>;
}

/// Opaque token identifying one delivery for ack/nack
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub topic: String,
    pub delivery_id: u64,
}

/// One message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub payload: Vec<u8>,
    /// Number of times this payload was handed out before
    pub redelivery_count: u32,
}

/// Consume side of the broker
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Pull up to `max` deliveries from a topic without blocking
    async fn receive(&self, topic: &str, max: usize) -> BrokerResult<Vec<Delivery>>;

    /// Acknowledge a delivery; it will not be delivered again
    async fn ack(&self, handle: &DeliveryHandle) -> BrokerResult<()>;

    /// Leave a delivery unacknowledged so the broker redelivers it
    async fn nack(&self, handle: &DeliveryHandle) -> BrokerResult<()>;
}
