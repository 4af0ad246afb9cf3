//! Structured handler outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a handler reports back for one integration event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum IntegrationEventHandlingResult {
    Success,
    /// Transient failure; the delivery is handed back for redelivery
    RetryableFailure(String),
    /// The event can never be handled; it is acknowledged and dropped
    PermanentFailure(String),
}

impl IntegrationEventHandlingResult {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::RetryableFailure(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(message) | Self::PermanentFailure(message) => Some(message),
        }
    }

    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure(_) => "retryable_failure",
            Self::PermanentFailure(_) => "permanent_failure",
        }
    }
}

impl fmt::Display for IntegrationEventHandlingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_message() {
            Some(message) => write!(f, "{}: {}", self.outcome(), message),
            None => f.write_str(self.outcome()),
        }
    }
}
