//! # Outbox Message Model
//!
//! The unit of durable intent: one row per integration event, written in the
//! same transaction as the domain change that produced it.

use crate::error::{OutboxError, OutboxResult};
use crate::models::integration_event::IntegrationEvent;
use crate::state_machine::{next_status, OutboxEvent, OutboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted outbox row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// Event type discriminator used for routing and handler lookup
    pub message_type: String,
    /// Serialized integration event
    pub payload_json: String,
    /// Partition/topic hint; overrides the configured topic route when set
    pub routing_key: Option<String>,
    /// Unique across all rows when present
    pub deduplication_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the broker acknowledged the publish
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    /// When a failed message becomes eligible for requeue
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current relay claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// Relay instance holding the current claim
    pub claimed_by: Option<String>,
}

impl OutboxMessage {
    /// Apply a lifecycle event, rejecting transitions the state machine forbids
    fn transition(&mut self, event: &OutboxEvent) -> OutboxResult<()> {
        match next_status(self.status, event) {
            Some(next) => {
                self.status = next;
                Ok(())
            }
            None => Err(OutboxError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: event.event_type().to_string(),
            }),
        }
    }

    /// Pending -> Processing
    pub fn claim(&mut self, holder: &str, now: DateTime<Utc>) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Claim)?;
        self.claimed_at = Some(now);
        self.claimed_by = Some(holder.to_string());
        Ok(())
    }

    /// Processing -> Sent
    pub fn mark_sent(&mut self, processed_at: DateTime<Utc>) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Publish)?;
        self.attempts += 1;
        self.processed_at = Some(processed_at);
        self.next_attempt_at = None;
        self.clear_claim();
        Ok(())
    }

    /// Processing -> Failed, with the retry time already computed
    pub fn mark_failed(
        &mut self,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Fail(error.to_string()))?;
        self.attempts = attempts;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = Some(next_attempt_at);
        self.clear_claim();
        Ok(())
    }

    /// Processing | Failed -> Dead
    pub fn mark_dead(&mut self, attempts: u32, error: &str) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Abandon(error.to_string()))?;
        self.attempts = attempts;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = None;
        self.clear_claim();
        Ok(())
    }

    /// Failed -> Pending once the backoff elapsed
    pub fn requeue(&mut self) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Requeue)?;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Processing -> Pending for stale or cancelled claims
    pub fn release(&mut self) -> OutboxResult<()> {
        self.transition(&OutboxEvent::Release)?;
        self.clear_claim();
        Ok(())
    }

    /// Whether a failed message's backoff has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Failed
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Whether a processing claim was taken before `cutoff`
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Processing
            && self.claimed_at.map(|at| at < cutoff).unwrap_or(true)
    }

    fn clear_claim(&mut self) {
        self.claimed_at = None;
        self.claimed_by = None;
    }
}

/// Caller-supplied enqueue request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload_json: String,
    pub routing_key: Option<String>,
    pub deduplication_key: Option<String>,
}

impl NewOutboxMessage {
    /// Create an enqueue request from an already-serialized payload
    pub fn new(message_type: impl Into<String>, payload_json: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload_json: payload_json.into(),
            routing_key: None,
            deduplication_key: None,
        }
    }

    /// Serialize an integration event into an enqueue request
    pub fn from_event<T: Serialize>(
        message_type: impl Into<String>,
        event: &IntegrationEvent<T>,
    ) -> OutboxResult<Self> {
        let payload_json = serde_json::to_string(event)?;
        Ok(Self::new(message_type, payload_json))
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_deduplication_key(mut self, deduplication_key: impl Into<String>) -> Self {
        self.deduplication_key = Some(deduplication_key.into());
        self
    }

    /// Materialize the pending row written at enqueue time
    pub fn into_message(self, created_at: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id: self.id,
            message_type: self.message_type,
            payload_json: self.payload_json,
            routing_key: self.routing_key,
            deduplication_key: self.deduplication_key,
            created_at,
            processed_at: None,
            attempts: 0,
            status: OutboxStatus::Pending,
            last_error: None,
            next_attempt_at: None,
            claimed_at: None,
            claimed_by: None,
        }
    }
}
