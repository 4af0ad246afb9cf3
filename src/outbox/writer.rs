//! # Enqueue Boundary
//!
//! Outbox rows are written through the caller's open unit of work so the
//! domain change and the event intent commit or roll back together. A
//! writer never commits on its own.

use crate::error::OutboxResult;
use crate::models::{IntegrationEvent, NewOutboxMessage};
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// Enqueue an outbox row inside an already-open transaction
#[async_trait]
pub trait OutboxWriter: Send {
    /// Stage one row; fails with `DuplicateEvent` when its deduplication key exists
    async fn enqueue(&mut self, message: NewOutboxMessage) -> OutboxResult<Uuid>;

    /// Stage a row from its raw parts
    async fn enqueue_json(
        &mut self,
        message_type: &str,
        payload_json: &str,
        routing_key: Option<&str>,
        deduplication_key: Option<&str>,
    ) -> OutboxResult<Uuid> {
        let mut message = NewOutboxMessage::new(message_type, payload_json);
        message.routing_key = routing_key.map(str::to_string);
        message.deduplication_key = deduplication_key.map(str::to_string);
        self.enqueue(message).await
    }

    /// Serialize and stage an integration event
    async fn enqueue_event<T>(
        &mut self,
        message_type: &str,
        event: &IntegrationEvent<T>,
        deduplication_key: Option<&str>,
    ) -> OutboxResult<Uuid>
    where
        T: Serialize + Sync,
    {
        let mut message = NewOutboxMessage::from_event(message_type, event)?;
        message.deduplication_key = deduplication_key.map(str::to_string);
        self.enqueue(message).await
    }
}
