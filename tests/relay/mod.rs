//! Relay cycles: publish, retry with backoff, dead-lettering, stale claim
//! recovery and leader exclusivity.

use crate::common::{TestHarness, TOPIC};
use chrono::{Duration as ChronoDuration, Utc};
use outbox_core::config::RelayConfig;
use outbox_core::leader::InMemoryLeaderLock;
use outbox_core::messaging::{BrokerEnvelope, InMemoryBroker};
use outbox_core::outbox::OutboxRepository;
use outbox_core::relay::{RelayCycleOutcome, RetrySweep};
use outbox_core::state_machine::OutboxStatus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_exhausted_retries_dead_letter_with_attempts_equal_to_max() {
    let harness = TestHarness::new();
    let max_retries = harness.retry.max_retries;
    let id = harness.enqueue_task_created("7", None).await;
    harness.broker.fail_next(max_retries);

    let relay = harness.relay("relay-a");
    let cancel = CancellationToken::new();

    for attempt in 1..max_retries {
        let summary = relay.run_cycle(&cancel).await.unwrap().summary().copied().unwrap();
        assert_eq!(summary.failed, 1);

        let message = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, attempt);
        assert!(message.next_attempt_at.unwrap() > Utc::now());

        // Not due yet, then due once the backoff has elapsed
        assert_eq!(harness.store.requeue_due(Utc::now(), 10).await.unwrap(), 0);
        let later = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(harness.store.requeue_due(later, 10).await.unwrap(), 1);
    }

    let summary = relay.run_cycle(&cancel).await.unwrap().summary().copied().unwrap();
    assert_eq!(summary.dead, 1);

    let message = harness.store.find(id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Dead);
    assert_eq!(message.attempts, max_retries);
    assert!(message.last_error.is_some());
    assert_eq!(harness.broker.published_count(), 0);

    // Dead rows are never claimed again
    let summary = relay.run_cycle(&cancel).await.unwrap().summary().copied().unwrap();
    assert_eq!(summary.claimed, 0);
}

#[tokio::test]
async fn test_second_attempt_succeeds_after_sweep() {
    let harness = TestHarness::new();
    let id = harness.enqueue_task_created("8", Some("task-8-created")).await;
    harness.broker.fail_next(1);

    let relay = harness.relay("relay-a");
    let cancel = CancellationToken::new();
    relay.run_cycle(&cancel).await.unwrap();
    assert_eq!(
        harness.store.find(id).await.unwrap().unwrap().status,
        OutboxStatus::Failed
    );

    // Nothing is due yet for the sweep
    let sweep = RetrySweep::new(Arc::new(harness.store.clone()), harness.retry.clone());
    assert_eq!(sweep.sweep_once().await.unwrap(), 0);

    let later = Utc::now() + ChronoDuration::minutes(10);
    harness.store.requeue_due(later, 10).await.unwrap();
    let summary = relay.run_cycle(&cancel).await.unwrap().summary().copied().unwrap();
    assert_eq!(summary.sent, 1);

    let message = harness.store.find(id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Sent);
    assert_eq!(message.attempts, 2);
    assert!(message.processed_at.is_some());

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    let envelope = BrokerEnvelope::decode(&published[0].payload).unwrap();
    assert_eq!(envelope.message_id, id);
    assert_eq!(envelope.deduplication_key.as_deref(), Some("task-8-created"));
}

#[tokio::test]
async fn test_failed_publishes_back_off_exponentially() {
    let harness = TestHarness::new();
    assert!(!harness.retry.jitter_enabled);
    let id = harness.enqueue_task_created("9", None).await;
    harness.broker.fail_next(2);

    let relay = harness.relay("relay-a");
    let cancel = CancellationToken::new();

    for (attempt, expected_delay) in [(1, 2), (2, 4)] {
        let before = Utc::now();
        relay.run_cycle(&cancel).await.unwrap();
        let after = Utc::now();

        let message = harness.store.find(id).await.unwrap().unwrap();
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, attempt);
        let next = message.next_attempt_at.unwrap();
        let delay = ChronoDuration::seconds(expected_delay);
        assert!(next >= before + delay, "attempt {attempt}: {next} before {before} + {delay}");
        assert!(next <= after + delay, "attempt {attempt}: {next} after {after} + {delay}");

        harness.store.requeue_due(next, 10).await.unwrap();
    }

    relay.run_cycle(&cancel).await.unwrap();
    let message = harness.store.find(id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Sent);
    assert_eq!(message.attempts, 3);
}

#[tokio::test]
async fn test_stale_processing_claim_is_recovered_and_sent() {
    let harness = TestHarness::new();
    let id = harness.enqueue_task_created("5", None).await;

    // A relay that crashed mid-batch ten minutes ago
    let crashed_at = Utc::now() - ChronoDuration::minutes(10);
    let claimed = harness
        .store
        .claim_batch("relay-crashed", 10, crashed_at)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let summary = harness
        .relay("relay-b")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap()
        .summary()
        .copied()
        .unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.sent, 1);

    let message = harness.store.find(id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Sent);
    assert_eq!(message.attempts, 1);
    assert!(message.claimed_by.is_none());
}

#[tokio::test]
async fn test_fresh_processing_claim_is_left_alone() {
    let harness = TestHarness::new();
    harness.enqueue_task_created("6", None).await;
    harness
        .store
        .claim_batch("relay-live", 10, Utc::now())
        .await
        .unwrap();

    let summary = harness
        .relay("relay-b")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap()
        .summary()
        .copied()
        .unwrap();
    assert_eq!(summary.recovered, 0);
    assert_eq!(summary.claimed, 0);
    assert_eq!(harness.store.status_counts().await.unwrap().processing, 1);
}

#[tokio::test]
async fn test_batches_are_published_in_creation_order() {
    let harness = TestHarness::new();
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(harness.enqueue_task_created(&n.to_string(), None).await);
    }

    harness
        .relay("relay-a")
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let published: Vec<_> = harness
        .broker
        .published()
        .iter()
        .map(|record| {
            assert_eq!(record.topic, TOPIC);
            BrokerEnvelope::decode(&record.payload).unwrap().message_id
        })
        .collect();
    assert_eq!(published, ids);
}

#[tokio::test]
async fn test_concurrent_relays_never_double_publish() {
    let harness =
        TestHarness::with_broker(InMemoryBroker::new().with_publish_delay(Duration::from_millis(50)));
    for n in 0..3 {
        harness.enqueue_task_created(&n.to_string(), None).await;
    }

    let relay_a = harness.relay("relay-a");
    let relay_b = harness.relay("relay-b");
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(relay_a.run_cycle(&cancel), relay_b.run_cycle(&cancel));
    let outcomes = [a.unwrap(), b.unwrap()];

    let skipped = outcomes
        .iter()
        .filter(|outcome| **outcome == RelayCycleOutcome::Skipped)
        .count();
    assert_eq!(skipped, 1);

    let sent: u64 = outcomes
        .iter()
        .filter_map(|outcome| outcome.summary())
        .map(|summary| summary.sent)
        .sum();
    assert_eq!(sent, 3);
    assert_eq!(harness.broker.published_count(), 3);

    // The lease was released, so the next cycle runs
    let next = relay_b.run_cycle(&cancel).await.unwrap();
    assert!(matches!(next, RelayCycleOutcome::Completed(_)));
    assert_eq!(harness.broker.published_count(), 3);
}

#[tokio::test]
async fn test_lapsed_lease_never_publishes_twice() {
    let harness =
        TestHarness::with_broker(InMemoryBroker::new().with_publish_delay(Duration::from_millis(150)));
    for n in 0..3 {
        harness.enqueue_task_created(&n.to_string(), None).await;
    }

    // Each publish outlives the lease, and a claim goes stale soon after
    let config = RelayConfig {
        lease_ttl_seconds: 0.1,
        stale_processing_timeout_seconds: 0.3,
        publish_timeout_seconds: 0.28,
        ..RelayConfig::default()
    };
    let lock = InMemoryLeaderLock::new(config.lease_ttl());
    let relay_a = harness.relay_with("relay-a", lock.clone(), config.clone());
    let relay_b = harness.relay_with("relay-b", lock, config);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(relay_a.run_cycle(&cancel), async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        relay_b.run_cycle(&cancel).await
    });
    let a = a.unwrap();
    let summary = a.summary().copied().unwrap();
    assert!(summary.lease_lost);
    assert_eq!(summary.sent, 1);
    assert!(b.is_ok());

    for _ in 0..10 {
        if harness.store.status_counts().await.unwrap().outstanding() == 0 {
            break;
        }
        relay_a.run_cycle(&cancel).await.unwrap();
    }

    let counts = harness.store.status_counts().await.unwrap();
    assert_eq!(counts.sent, 3);
    let published = harness.broker.published();
    let unique: HashSet<_> = published
        .iter()
        .map(|record| BrokerEnvelope::decode(&record.payload).unwrap().message_id)
        .collect();
    assert_eq!(published.len(), 3);
    assert_eq!(unique.len(), 3);
}
