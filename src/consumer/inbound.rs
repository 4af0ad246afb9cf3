//! # Inbound Consumer
//!
//! Per-topic consume loop with bounded concurrency. Each delivery goes
//! through the deduplication guard before the dispatcher sees it, so a
//! redelivered or republished event never runs its handler twice.
//!
//! | Dedup / handler outcome      | Broker action |
//! |------------------------------|---------------|
//! | Undecodable envelope         | ack (drop)    |
//! | Key already processed        | ack           |
//! | Key in flight elsewhere      | nack          |
//! | `Success`                    | ack           |
//! | `PermanentFailure`           | ack           |
//! | `RetryableFailure`           | nack          |

use super::dedup::{DeduplicationStore, ReserveOutcome};
use crate::config::ConsumerConfig;
use crate::constants::operations;
use crate::dispatch::{IntegrationEventDispatcher, IntegrationEventHandlingResult};
use crate::error::OutboxResult;
use crate::logging::log_delivery_operation;
use crate::messaging::{BrokerConsumer, BrokerEnvelope, Delivery};
use crate::metrics;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Handled,
    /// Handler reported a permanent failure; acknowledged anyway
    Rejected,
    /// Handler asked for redelivery
    Redeliver,
    Duplicate,
    /// Another delivery of the same key is being handled
    InFlightElsewhere,
    /// Envelope could not be decoded
    Poison,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    handled: AtomicU64,
    rejected: AtomicU64,
    redelivered: AtomicU64,
    duplicates: AtomicU64,
    poisoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub handled: u64,
    pub rejected: u64,
    pub redelivered: u64,
    pub duplicates: u64,
    pub poisoned: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: ConsumeOutcome) {
        let counter = match outcome {
            ConsumeOutcome::Handled => &self.handled,
            ConsumeOutcome::Rejected => &self.rejected,
            ConsumeOutcome::Redeliver | ConsumeOutcome::InFlightElsewhere => &self.redelivered,
            ConsumeOutcome::Duplicate => &self.duplicates,
            ConsumeOutcome::Poison => &self.poisoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct InboundConsumer {
    topic: String,
    broker: Arc<dyn BrokerConsumer>,
    dedup: Arc<dyn DeduplicationStore>,
    dispatcher: IntegrationEventDispatcher,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl std::fmt::Debug for InboundConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundConsumer")
            .field("topic", &self.topic)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InboundConsumer {
    pub fn new(
        topic: impl Into<String>,
        broker: Arc<dyn BrokerConsumer>,
        dedup: Arc<dyn DeduplicationStore>,
        dispatcher: IntegrationEventDispatcher,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            broker,
            dedup,
            dispatcher,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Run one delivery through dedup, dispatch and ack/nack
    pub async fn process_delivery(
        &self,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> OutboxResult<ConsumeOutcome> {
        let outcome = self.handle_delivery(&delivery, cancel).await;
        if let Ok(outcome) = &outcome {
            self.stats.record(*outcome);
        }
        outcome
    }

    async fn handle_delivery(
        &self,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> OutboxResult<ConsumeOutcome> {
        let envelope = match BrokerEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    topic = %self.topic,
                    delivery_id = delivery.handle.delivery_id,
                    error = %e,
                    "Dropping undecodable delivery"
                );
                metrics::deliveries_poisoned_total()
                    .add(1, &[KeyValue::new("topic", self.topic.clone())]);
                self.broker.ack(&delivery.handle).await?;
                return Ok(ConsumeOutcome::Poison);
            }
        };

        let key = envelope.dedup_key();
        let message_type = envelope.message_type.as_str();

        // Without a reservation the delivery cannot be handled safely
        let reservation = match self.dedup.try_reserve(&key, Utc::now()).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.broker.nack(&delivery.handle).await?;
                return Err(e);
            }
        };

        match reservation {
            ReserveOutcome::AlreadyProcessed => {
                debug!(
                    topic = %self.topic,
                    deduplication_key = %key,
                    redelivery_count = delivery.redelivery_count,
                    "Duplicate delivery discarded"
                );
                metrics::deliveries_deduplicated_total()
                    .add(1, &[KeyValue::new("topic", self.topic.clone())]);
                self.broker.ack(&delivery.handle).await?;
                return Ok(ConsumeOutcome::Duplicate);
            }
            ReserveOutcome::InFlight => {
                debug!(
                    topic = %self.topic,
                    deduplication_key = %key,
                    "Delivery already in flight, leaving for redelivery"
                );
                self.broker.nack(&delivery.handle).await?;
                return Ok(ConsumeOutcome::InFlightElsewhere);
            }
            ReserveOutcome::Reserved => {}
        }

        let result = self.dispatcher.dispatch(&envelope, cancel).await;
        match &result {
            IntegrationEventHandlingResult::Success => {
                self.complete(&key).await;
                self.broker.ack(&delivery.handle).await?;
                log_delivery_operation(&self.topic, &key, Some(message_type), "handled", None);
                Ok(ConsumeOutcome::Handled)
            }
            IntegrationEventHandlingResult::PermanentFailure(reason) => {
                error!(
                    topic = %self.topic,
                    deduplication_key = %key,
                    message_id = %envelope.message_id,
                    message_type = %message_type,
                    reason = %reason,
                    "Integration event permanently failed, not retrying"
                );
                self.complete(&key).await;
                self.broker.ack(&delivery.handle).await?;
                Ok(ConsumeOutcome::Rejected)
            }
            IntegrationEventHandlingResult::RetryableFailure(reason) => {
                warn!(
                    topic = %self.topic,
                    deduplication_key = %key,
                    message_type = %message_type,
                    redelivery_count = delivery.redelivery_count,
                    reason = %reason,
                    "Integration event handling failed, requesting redelivery"
                );
                if let Err(e) = self.dedup.release(&key).await {
                    error!(deduplication_key = %key, error = %e, "Failed to release dedup reservation");
                }
                self.broker.nack(&delivery.handle).await?;
                Ok(ConsumeOutcome::Redeliver)
            }
        }
    }

    /// The handler already ran, so the delivery is acked even if this fails
    async fn complete(&self, key: &str) {
        if let Err(e) = self.dedup.mark_processed(key, Utc::now()).await {
            error!(
                topic = %self.topic,
                deduplication_key = %key,
                error = %e,
                "Failed to record processed deduplication key"
            );
        }
    }

    /// Receive one batch and process it with bounded concurrency.
    ///
    /// Returns the number of deliveries received.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> OutboxResult<usize> {
        let deliveries = self
            .broker
            .receive(&self.topic, self.config.receive_batch_size)
            .await?;
        let received = deliveries.len();
        if received == 0 {
            return Ok(0);
        }

        stream::iter(deliveries)
            .for_each_concurrent(self.config.max_concurrency.max(1), |delivery| async move {
                let delivery_id = delivery.handle.delivery_id;
                if let Err(e) = self.process_delivery(delivery, cancel).await {
                    error!(
                        topic = %self.topic,
                        delivery_id,
                        operation = operations::CONSUME,
                        error = %e,
                        "Delivery processing failed"
                    );
                }
            })
            .await;

        Ok(received)
    }

    /// Poll until cancelled, idling briefly when the topic is empty
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            topic = %self.topic,
            max_concurrency = self.config.max_concurrency,
            "Starting inbound consumer"
        );

        while !cancel.is_cancelled() {
            let idle = match self.poll_once(&cancel).await {
                Ok(received) => received == 0,
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "Consumer poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll()) => {}
                }
            }
        }

        info!(topic = %self.topic, "Inbound consumer stopped");
    }
}
