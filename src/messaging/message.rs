//! # Broker Envelope
//!
//! Wire format of a published outbox message. The integration event travels
//! as parsed JSON next to the identifiers the consumer needs for
//! deduplication and handler lookup.

use crate::error::OutboxResult;
use crate::models::{IntegrationEvent, OutboxMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message published to the broker by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    /// Outbox row id, stable across republishes
    pub message_id: Uuid,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_key: Option<String>,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl BrokerEnvelope {
    /// Build the envelope for an outbox row, parsing its payload.
    ///
    /// Fails when `payload_json` is not valid JSON, which can never succeed
    /// on retry.
    pub fn from_outbox(message: &OutboxMessage) -> OutboxResult<Self> {
        let payload = serde_json::from_str(&message.payload_json)?;
        Ok(Self {
            message_id: message.id,
            message_type: message.message_type.clone(),
            routing_key: message.routing_key.clone(),
            deduplication_key: message.deduplication_key.clone(),
            payload,
            published_at: Utc::now(),
        })
    }

    /// Key the consumer deduplicates on: the caller's key, else the outbox id
    pub fn dedup_key(&self) -> String {
        self.deduplication_key
            .clone()
            .unwrap_or_else(|| self.message_id.to_string())
    }

    /// Parse the payload as an untyped integration event
    pub fn integration_event(&self) -> Result<IntegrationEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Correlation id of the carried event, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.get("correlation_id").and_then(|v| v.as_str())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
