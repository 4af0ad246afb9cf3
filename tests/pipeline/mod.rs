//! Supervised pipeline: background relay and consumer deliver a committed
//! event to its handler, and shutdown stops every service.

use crate::common::{counting_registry, TestHarness};
use outbox_core::config::OutboxConfig;
use outbox_core::outbox::OutboxRepository;
use outbox_core::pipeline::{OutboxPipeline, PipelineComponents};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> OutboxConfig {
    let mut config = OutboxConfig::default();
    config.relay.poll_delay_seconds = 0.02;
    config.consumer.idle_poll_millis = 10;
    config
}

#[tokio::test]
async fn test_pipeline_delivers_committed_event() {
    let harness = TestHarness::new();
    let (registry, calls) = counting_registry();

    let pipeline = OutboxPipeline::start(PipelineComponents {
        config: fast_config(),
        repository: Arc::new(harness.store.clone()),
        publisher: Arc::new(harness.broker.clone()),
        consumer: Arc::new(harness.broker.clone()),
        dedup_store: harness.dedup.clone(),
        leader_lock: harness.lock.clone(),
        registry,
    })
    .unwrap();

    harness
        .enqueue_task_created("123", Some("task-123-created"))
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event was not delivered");

    let counts = harness.store.status_counts().await.unwrap();
    assert_eq!(counts.sent, 1);
    assert_eq!(counts.outstanding(), 0);
    assert_eq!(pipeline.relay_stats().messages_sent, 1);

    pipeline.shutdown().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_shared_token() {
    let harness = TestHarness::new();
    let (registry, _calls) = counting_registry();

    let pipeline = OutboxPipeline::start(PipelineComponents {
        config: fast_config(),
        repository: Arc::new(harness.store.clone()),
        publisher: Arc::new(harness.broker.clone()),
        consumer: Arc::new(harness.broker.clone()),
        dedup_store: harness.dedup.clone(),
        leader_lock: harness.lock.clone(),
        registry,
    })
    .unwrap();

    let token = pipeline.cancellation_token();
    assert!(!token.is_cancelled());
    pipeline.shutdown().await.unwrap();
    assert!(token.is_cancelled());
}
