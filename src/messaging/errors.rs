//! # Broker Error Types
//!
//! Failures at the publish/consume boundary. Every variant is treated as
//! transient by the relay; classification only affects logging and metrics.

use thiserror::Error;

/// Broker boundary errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Publish to {topic} rejected: {message}")]
    Rejected { topic: String, message: String },

    #[error("Broker operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unknown delivery {delivery_id} on topic {topic}")]
    UnknownDelivery { topic: String, delivery_id: u64 },

    #[error("Envelope decode error: {message}")]
    Decode { message: String },
}

impl BrokerError {
    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a rejected error
    pub fn rejected(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::Timeout { .. } => "timeout",
            Self::UnknownDelivery { .. } => "unknown_delivery",
            Self::Decode { .. } => "decode",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Decode {
            message: err.to_string(),
        }
    }
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
