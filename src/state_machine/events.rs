use serde::{Deserialize, Serialize};

/// Events that move an outbox message between statuses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboxEvent {
    /// Relay claims a pending message
    Claim,
    /// Broker acknowledged the publish
    Publish,
    /// Publish failed and a retry is scheduled
    Fail(String),
    /// Retries exhausted or failure is permanent
    Abandon(String),
    /// Retry sweep found the backoff elapsed
    Requeue,
    /// Stale or cancelled claim handed back to the pending pool
    Release,
}

impl OutboxEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Publish => "publish",
            Self::Fail(_) => "fail",
            Self::Abandon(_) => "abandon",
            Self::Requeue => "requeue",
            Self::Release => "release",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) | Self::Abandon(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Publish | Self::Abandon(_))
    }
}
