//! # In-Memory Broker
//!
//! Process-local broker with per-topic queues, an in-flight table and
//! ack/nack redelivery. Used for development and tests; production
//! deployments plug a real broker client in behind the same traits.

use super::broker::{BrokerConsumer, BrokerPublisher, Delivery, DeliveryHandle};
use super::errors::{BrokerError, BrokerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One accepted publish, kept for inspection
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, VecDeque<QueuedMessage>>,
    in_flight: HashMap<u64, (String, QueuedMessage)>,
    next_delivery_id: u64,
    published: Vec<PublishedRecord>,
    failures_remaining: u32,
    unavailable: bool,
    acked: u64,
    nacked: u64,
}

/// Cloneable handle to a shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    publish_delay: Option<Duration>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every publish, simulating broker round-trip latency
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    /// Reject the next `count` publishes
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    /// Reject every publish until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Every accepted publish in order
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state.lock().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published.len()
    }

    /// Messages waiting on a topic (not yet handed out)
    pub fn queued_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Deliveries handed out and neither acked nor nacked
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn nacked_count(&self) -> u64 {
        self.state.lock().nacked
    }

    /// Put a raw payload on a topic without going through publish bookkeeping
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(QueuedMessage {
                payload,
                redelivery_count: 0,
            });
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()> {
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.unavailable {
            return Err(BrokerError::unavailable("broker marked unavailable"));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            warn!(topic = %topic, "In-memory broker rejecting publish (injected failure)");
            return Err(BrokerError::unavailable("injected publish failure"));
        }

        state.published.push(PublishedRecord {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(QueuedMessage {
                payload,
                redelivery_count: 0,
            });

        debug!(topic = %topic, "In-memory broker accepted publish");
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryBroker {
    async fn receive(&self, topic: &str, max: usize) -> BrokerResult<Vec<Delivery>> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(message) = queue.pop_front() else {
                break;
            };
            state.next_delivery_id += 1;
            let delivery_id = state.next_delivery_id;
            deliveries.push(Delivery {
                handle: DeliveryHandle {
                    topic: topic.to_string(),
                    delivery_id,
                },
                payload: message.payload.clone(),
                redelivery_count: message.redelivery_count,
            });
            state
                .in_flight
                .insert(delivery_id, (topic.to_string(), message));
        }
        Ok(deliveries)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> BrokerResult<()> {
        let mut state = self.state.lock();
        match state.in_flight.remove(&handle.delivery_id) {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => Err(BrokerError::UnknownDelivery {
                topic: handle.topic.clone(),
                delivery_id: handle.delivery_id,
            }),
        }
    }

    async fn nack(&self, handle: &DeliveryHandle) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let Some((topic, mut message)) = state.in_flight.remove(&handle.delivery_id) else {
            return Err(BrokerError::UnknownDelivery {
                topic: handle.topic.clone(),
                delivery_id: handle.delivery_id,
            });
        };
        message.redelivery_count += 1;
        state.nacked += 1;
        state.topics.entry(topic).or_default().push_back(message);
        Ok(())
    }
}
