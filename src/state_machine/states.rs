use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbox message status as persisted in the `status` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed by the relay
    #[default]
    Pending,
    /// Claimed by a relay cycle, publish in progress
    Processing,
    /// Published to the broker
    Sent,
    /// Publish failed, waiting for its backoff to elapse
    Failed,
    /// Abandoned after exhausting retries or a permanent failure
    Dead,
}

impl OutboxStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }

    /// Check if this is an active state (message is being published)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }

    /// Check if the message still owes a delivery attempt
    pub fn is_outstanding(&self) -> bool {
        !self.is_terminal()
    }

    /// Column value for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("Invalid outbox status: {s}")),
        }
    }
}
