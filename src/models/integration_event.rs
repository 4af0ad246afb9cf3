//! # Integration Event
//!
//! The logical event carried inside an outbox message's payload. Common
//! envelope fields sit beside the event-specific body, which is flattened
//! into the same JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cross-service event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent<T = serde_json::Value> {
    pub id: Uuid,
    /// Traces a causal chain across services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub occurred_on_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub data: T,
}

impl<T> IntegrationEvent<T> {
    /// Wrap an event body with a fresh id and the current time
    pub fn new(data: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            occurred_on_utc: Utc::now(),
            data,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_occurred_on(mut self, occurred_on_utc: DateTime<Utc>) -> Self {
        self.occurred_on_utc = occurred_on_utc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TaskCreated {
        task_id: String,
        list_id: String,
    }

    #[test]
    fn test_typed_body_is_flattened() {
        let event = IntegrationEvent::new(TaskCreated {
            task_id: "task-123".into(),
            list_id: "list-9".into(),
        });
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["task_id"], "task-123");
        assert_eq!(value["list_id"], "list-9");
        assert!(value.get("correlation_id").is_none());

        let parsed: IntegrationEvent<TaskCreated> = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_untyped_envelope_keeps_body_fields() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "occurred_on_utc": "2025-01-01T00:00:00Z",
            "correlation_id": "req-7",
            "task_id": "task-1"
        });
        let event: IntegrationEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(event.data["task_id"], "task-1");
    }
}
