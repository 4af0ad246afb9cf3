//! Enqueue boundary: atomicity with the domain write and deduplication.

use crate::common::TestHarness;
use outbox_core::models::NewOutboxMessage;
use outbox_core::outbox::{OutboxRepository, OutboxWriter};
use outbox_core::state_machine::OutboxStatus;
use outbox_core::OutboxError;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_duplicate_deduplication_key_rejected_and_original_untouched() {
    let harness = TestHarness::new();
    let first = harness
        .enqueue_task_created("123", Some("task-123-created"))
        .await;

    let mut uow = harness.store.begin();
    let err = uow
        .enqueue(
            NewOutboxMessage::new("TaskCreated", r#"{"task_id":"123"}"#)
                .with_deduplication_key("task-123-created"),
        )
        .await
        .unwrap_err();
    assert!(err.is_duplicate_event());
    uow.rollback();

    assert_eq!(harness.store.len(), 1);
    let original = harness.store.find(first).await.unwrap().unwrap();
    assert_eq!(original.status, OutboxStatus::Pending);
    assert_eq!(original.attempts, 0);
    assert_eq!(
        original.deduplication_key.as_deref(),
        Some("task-123-created")
    );
}

#[tokio::test]
async fn test_messages_without_key_are_never_deduplicated() {
    let harness = TestHarness::new();
    harness.enqueue_task_created("1", None).await;
    harness.enqueue_task_created("1", None).await;

    assert_eq!(harness.store.status_counts().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_rolled_back_domain_write_leaves_no_outbox_row() {
    let harness = TestHarness::new();
    let domain_written = Arc::new(AtomicBool::new(false));

    let mut uow = harness.store.begin();
    let flag = Arc::clone(&domain_written);
    uow.stage_domain_write(move || flag.store(true, Ordering::SeqCst));
    uow.enqueue_json("TaskCreated", r#"{"task_id":"9"}"#, None, Some("task-9-created"))
        .await
        .unwrap();
    uow.rollback();

    assert!(harness.store.is_empty());
    assert!(!domain_written.load(Ordering::SeqCst));

    // The key is free again once the first attempt rolled back
    let mut uow = harness.store.begin();
    let flag = Arc::clone(&domain_written);
    uow.stage_domain_write(move || flag.store(true, Ordering::SeqCst));
    uow.enqueue_json("TaskCreated", r#"{"task_id":"9"}"#, None, Some("task-9-created"))
        .await
        .unwrap();
    uow.commit().unwrap();

    assert_eq!(harness.store.len(), 1);
    assert!(domain_written.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_racing_units_of_work_commit_only_one_keyed_row() {
    let harness = TestHarness::new();
    let message = || {
        NewOutboxMessage::new("ChatMessagePosted", json!({"message_id": "m-1"}).to_string())
            .with_deduplication_key("chat-m-1-posted")
    };

    let mut first = harness.store.begin();
    let mut second = harness.store.begin();
    first.enqueue(message()).await.unwrap();
    second.enqueue(message()).await.unwrap();

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, OutboxError::DuplicateEvent { .. }));
    assert_eq!(harness.store.len(), 1);
}
