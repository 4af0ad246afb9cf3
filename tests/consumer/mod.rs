//! Consumer side: idempotent dispatch across redeliveries, and the full
//! enqueue to handler path.

use crate::common::{counting_registry, TaskCreated, TestHarness, TOPIC};
use outbox_core::consumer::{DedupState, DeduplicationStore};
use outbox_core::dispatch::{IntegrationEventHandlingResult, IntegrationEventRegistry};
use outbox_core::messaging::BrokerConsumer;
use outbox_core::models::IntegrationEvent;
use outbox_core::outbox::OutboxRepository;
use outbox_core::state_machine::OutboxStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_task_created_flows_from_outbox_to_handler_once() {
    let harness = TestHarness::new();
    let id = harness
        .enqueue_task_created("123", Some("task-123-created"))
        .await;

    harness
        .relay("relay-a")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        harness.store.find(id).await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );

    let (registry, calls) = counting_registry();
    let consumer = harness.consumer(registry);
    let cancel = CancellationToken::new();
    assert_eq!(consumer.poll_once(&cancel).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = harness.dedup.get("task-123-created").await.unwrap().unwrap();
    assert_eq!(record.state, DedupState::Processed);

    // Broker redelivers the same message after a lost ack
    let payload = harness.broker.published()[0].payload.clone();
    harness.broker.inject(TOPIC, payload);
    assert_eq!(consumer.poll_once(&cancel).await.unwrap(), 1);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = consumer.stats().snapshot();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(harness.broker.in_flight_count(), 0);
}

#[tokio::test]
async fn test_retryable_failure_is_redelivered_then_handled() {
    let harness = TestHarness::new();
    harness.enqueue_task_created("42", Some("task-42-created")).await;
    harness
        .relay("relay-a")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let mut registry = IntegrationEventRegistry::new();
    registry
        .register_fn("TaskCreated", move |event: IntegrationEvent<TaskCreated>| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(event.data.task_id, "42");
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    IntegrationEventHandlingResult::retryable("search index unavailable")
                } else {
                    IntegrationEventHandlingResult::Success
                }
            }
        })
        .unwrap();

    let consumer = harness.consumer(registry);
    let cancel = CancellationToken::new();

    consumer.poll_once(&cancel).await.unwrap();
    assert_eq!(harness.broker.nacked_count(), 1);
    assert!(harness.dedup.get("task-42-created").await.unwrap().is_none());

    consumer.poll_once(&cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(harness.broker.acked_count(), 1);

    let stats = consumer.stats().snapshot();
    assert_eq!(stats.redelivered, 1);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn test_unregistered_event_type_is_acked_without_retry() {
    let harness = TestHarness::new();
    harness.enqueue_task_created("77", None).await;
    harness
        .relay("relay-a")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let consumer = harness.consumer(IntegrationEventRegistry::new());
    consumer.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(harness.broker.acked_count(), 1);
    assert_eq!(harness.broker.queued_count(TOPIC), 0);
    assert_eq!(consumer.stats().snapshot().rejected, 1);
}

#[tokio::test]
async fn test_undecodable_delivery_is_dropped() {
    let harness = TestHarness::new();
    harness.broker.inject(TOPIC, b"not an envelope".to_vec());

    let (registry, calls) = counting_registry();
    let consumer = harness.consumer(registry);
    consumer.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(consumer.stats().snapshot().poisoned, 1);
    assert!(harness.broker.receive(TOPIC, 10).await.unwrap().is_empty());
}
