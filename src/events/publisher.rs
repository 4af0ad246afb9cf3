use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// In-process notification that an aggregate changed.
///
/// Domain events are transient: nothing persists them and no subscriber is
/// required. Durable cross-service delivery goes through the outbox instead.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub id: Uuid,
    pub name: String,
    pub aggregate_id: Option<String>,
    pub context: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, context: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            aggregate_id: None,
            context,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }
}

/// Broadcast publisher for domain events
#[derive(Debug, Clone)]
pub struct DomainEventPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl DomainEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: DomainEvent) -> usize {
        // No subscribers is not an error for in-process notifications
        self.sender.send(event).unwrap_or(0)
    }

    /// Serialize `context` and publish it under `name`
    pub fn publish_serialized<T: Serialize>(
        &self,
        name: impl Into<String>,
        aggregate_id: impl Into<String>,
        context: &T,
    ) -> Result<usize, PublishError> {
        let event =
            DomainEvent::new(name, serde_json::to_value(context)?).with_aggregate_id(aggregate_id);
        Ok(self.publish(event))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Default for DomainEventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = DomainEventPublisher::default();
        assert_eq!(publisher.publish(DomainEvent::new("task.created", json!({}))), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = DomainEventPublisher::new(16);
        let mut receiver = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        let delivered = publisher
            .publish_serialized("task.created", "task-123", &json!({"name": "Write docs"}))
            .unwrap();
        assert_eq!(delivered, 1);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.name, "task.created");
        assert_eq!(event.aggregate_id.as_deref(), Some("task-123"));
        assert_eq!(event.context["name"], "Write docs");
    }
}
