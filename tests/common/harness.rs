//! Shared wiring for integration tests: one in-memory store, broker and
//! dedup store per test, plus helpers to enqueue and relay messages.

use outbox_core::config::{ConsumerConfig, RelayConfig, RetryConfig};
use outbox_core::consumer::{InMemoryDeduplicationStore, InboundConsumer};
use outbox_core::dispatch::{
    IntegrationEventDispatcher, IntegrationEventHandlingResult, IntegrationEventRegistry,
};
use outbox_core::leader::InMemoryLeaderLock;
use outbox_core::messaging::{InMemoryBroker, TopicRouter};
use outbox_core::models::{IntegrationEvent, NewOutboxMessage};
use outbox_core::outbox::{InMemoryOutboxStore, OutboxWriter};
use outbox_core::relay::OutboxRelay;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TOPIC: &str = "integration-events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub name: String,
}

pub struct TestHarness {
    pub store: InMemoryOutboxStore,
    pub broker: InMemoryBroker,
    pub lock: InMemoryLeaderLock,
    pub dedup: Arc<InMemoryDeduplicationStore>,
    pub retry: RetryConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_broker(InMemoryBroker::new())
    }

    pub fn with_broker(broker: InMemoryBroker) -> Self {
        Self {
            store: InMemoryOutboxStore::new(),
            broker,
            lock: InMemoryLeaderLock::new(Duration::from_secs(30)),
            dedup: Arc::new(InMemoryDeduplicationStore::default()),
            retry: RetryConfig::default(),
        }
    }

    pub fn relay(&self, instance_id: &str) -> OutboxRelay<InMemoryLeaderLock> {
        OutboxRelay::new(
            Arc::new(self.store.clone()),
            Arc::new(self.broker.clone()),
            self.lock.clone(),
            TopicRouter::new(TOPIC),
            RelayConfig::default(),
            &self.retry,
        )
        .with_instance_id(instance_id)
    }

    /// Relay with its own lease and relay settings over the shared store and broker
    pub fn relay_with(
        &self,
        instance_id: &str,
        lock: InMemoryLeaderLock,
        config: RelayConfig,
    ) -> OutboxRelay<InMemoryLeaderLock> {
        OutboxRelay::new(
            Arc::new(self.store.clone()),
            Arc::new(self.broker.clone()),
            lock,
            TopicRouter::new(TOPIC),
            config,
            &self.retry,
        )
        .with_instance_id(instance_id)
    }

    pub fn consumer(&self, registry: IntegrationEventRegistry) -> InboundConsumer {
        let config = ConsumerConfig::default();
        InboundConsumer::new(
            TOPIC,
            Arc::new(self.broker.clone()),
            self.dedup.clone(),
            IntegrationEventDispatcher::new(registry, config.processing_timeout()),
            config,
        )
    }

    /// Commit a TaskCreated message in its own unit of work
    pub async fn enqueue_task_created(&self, task_id: &str, dedup_key: Option<&str>) -> Uuid {
        let event = IntegrationEvent::new(TaskCreated {
            task_id: task_id.to_string(),
            name: format!("Task {task_id}"),
        });
        let mut message = NewOutboxMessage::from_event("TaskCreated", &event).unwrap();
        if let Some(key) = dedup_key {
            message = message.with_deduplication_key(key);
        }

        let mut uow = self.store.begin();
        let id = uow.enqueue(message).await.unwrap();
        uow.commit().unwrap();
        id
    }
}

/// Registry with a counting TaskCreated handler that always succeeds
pub fn counting_registry() -> (IntegrationEventRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = IntegrationEventRegistry::new();
    let counter = Arc::clone(&calls);
    registry
        .register_fn("TaskCreated", move |_event: IntegrationEvent<TaskCreated>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                IntegrationEventHandlingResult::Success
            }
        })
        .unwrap();
    (registry, calls)
}
