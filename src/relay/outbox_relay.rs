//! # Outbox Relay
//!
//! Single-leader polling loop that moves outbox rows onto the broker.
//!
//! ## Cycle
//!
//! 1. Try the leader lock; when another instance holds it, skip the cycle
//! 2. Reset processing rows whose claim is older than the stale timeout
//! 3. Claim up to `batch_size` pending rows, oldest first
//! 4. Before each publish, renew the lease and refresh the row's claim
//! 5. Publish each row in claim order and record its outcome
//! 6. Release the leader lock
//!
//! Failures are contained per message: a failed publish schedules a retry
//! (or dead-letters the row) and the batch moves on. Cancellation or a
//! lapsed lease between messages hands the unpublished remainder of the
//! batch back to pending. Outcomes are only recorded against rows this
//! relay still holds, so a row taken over after stale recovery is never
//! finished by two relays.

use crate::config::{RelayConfig, RetryConfig};
use crate::constants::operations;
use crate::error::{OutboxError, OutboxResult};
use crate::leader::LeaderLock;
use crate::logging::log_outbox_operation;
use crate::messaging::{BrokerEnvelope, BrokerError, BrokerPublisher, TopicRouter};
use crate::metrics;
use crate::models::OutboxMessage;
use crate::outbox::OutboxRepository;
use crate::relay::retry::{RetryDecision, RetryScheduler};
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-cycle tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCycleSummary {
    pub recovered: u64,
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
    pub released: u64,
    /// Claimed rows skipped because another relay had taken them over
    pub claims_lost: u64,
    /// Leadership lapsed mid-batch and the remainder was handed back
    pub lease_lost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCycleOutcome {
    /// Another instance held the leader lock
    Skipped,
    Completed(RelayCycleSummary),
}

impl RelayCycleOutcome {
    pub fn summary(&self) -> Option<&RelayCycleSummary> {
        match self {
            Self::Skipped => None,
            Self::Completed(summary) => Some(summary),
        }
    }
}

/// Cumulative counters since the relay was built
#[derive(Debug, Default)]
pub struct RelayStats {
    cycles_completed: AtomicU64,
    cycles_skipped: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_dead: AtomicU64,
    messages_recovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_dead: u64,
    pub messages_recovered: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_dead: self.messages_dead.load(Ordering::Relaxed),
            messages_recovered: self.messages_recovered.load(Ordering::Relaxed),
        }
    }

    fn record(&self, summary: &RelayCycleSummary) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.messages_sent.fetch_add(summary.sent, Ordering::Relaxed);
        self.messages_failed.fetch_add(summary.failed, Ordering::Relaxed);
        self.messages_dead.fetch_add(summary.dead, Ordering::Relaxed);
        self.messages_recovered
            .fetch_add(summary.recovered, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Sent,
    Failed,
    Dead,
    /// Outcome could not be recorded; stale recovery picks the row up later
    Unrecorded,
}

pub struct OutboxRelay<L: LeaderLock> {
    instance_id: String,
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn BrokerPublisher>,
    leader_lock: L,
    router: TopicRouter,
    retry: RetryScheduler,
    config: RelayConfig,
    stats: Arc<RelayStats>,
}

impl<L: LeaderLock> std::fmt::Debug for OutboxRelay<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("instance_id", &self.instance_id)
            .field("router", &self.router)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<L: LeaderLock> OutboxRelay<L> {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn BrokerPublisher>,
        leader_lock: L,
        router: TopicRouter,
        relay_config: RelayConfig,
        retry_config: &RetryConfig,
    ) -> Self {
        Self {
            instance_id: format!("relay-{}", Uuid::new_v4()),
            repository,
            publisher,
            leader_lock,
            router,
            retry: RetryScheduler::new(retry_config),
            config: relay_config,
            stats: Arc::new(RelayStats::default()),
        }
    }

    /// Override the generated instance id recorded in `claimed_by`
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Reset processing rows whose claim outlived the stale timeout
    pub async fn recover_stale(&self) -> OutboxResult<u64> {
        let timeout = chrono::Duration::from_std(self.config.stale_processing_timeout())
            .map_err(|e| OutboxError::internal(format!("stale timeout out of range: {e}")))?;
        let recovered = self.repository.recover_stale(Utc::now() - timeout).await?;

        if recovered > 0 {
            metrics::messages_recovered_total().add(recovered, &[]);
            warn!(
                relay = %self.instance_id,
                recovered,
                "Recovered stale processing outbox messages"
            );
        }
        Ok(recovered)
    }

    /// Run one leader-guarded relay cycle
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> OutboxResult<RelayCycleOutcome> {
        let Some(mut guard) = self
            .leader_lock
            .try_acquire(self.config.advisory_lock_key, &self.instance_id)
            .await?
        else {
            debug!(relay = %self.instance_id, "Leader lock held elsewhere, skipping cycle");
            self.stats.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            metrics::relay_cycles_total().add(1, &[KeyValue::new("outcome", "skipped")]);
            return Ok(RelayCycleOutcome::Skipped);
        };

        let started = Instant::now();
        let result = self.run_locked(&mut guard, cancel).await;

        if let Err(e) = self.leader_lock.release(guard).await {
            warn!(relay = %self.instance_id, error = %e, "Failed to release leader lock");
        }

        let outcome = if result.is_ok() { "completed" } else { "error" };
        metrics::relay_cycles_total().add(1, &[KeyValue::new("outcome", outcome)]);
        metrics::relay_cycle_duration().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        let summary = result?;
        self.stats.record(&summary);
        Ok(RelayCycleOutcome::Completed(summary))
    }

    async fn run_locked(
        &self,
        guard: &mut L::Guard,
        cancel: &CancellationToken,
    ) -> OutboxResult<RelayCycleSummary> {
        let mut summary = RelayCycleSummary {
            recovered: self.recover_stale().await?,
            ..RelayCycleSummary::default()
        };

        let batch = self
            .repository
            .claim_batch(&self.instance_id, self.config.batch_size, Utc::now())
            .await?;
        summary.claimed = batch.len() as u64;

        if batch.is_empty() {
            return Ok(summary);
        }
        log_outbox_operation(
            operations::CLAIM,
            None,
            None,
            "claimed",
            Some(&format!("{} messages", batch.len())),
        );

        for (index, message) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.released = self.release_remaining(&batch[index..]).await?;
                info!(
                    relay = %self.instance_id,
                    released = summary.released,
                    "Relay cancelled mid-batch, released remaining claims"
                );
                break;
            }

            if !self.still_leader(guard).await {
                summary.lease_lost = true;
                summary.released = self.release_remaining(&batch[index..]).await?;
                warn!(
                    relay = %self.instance_id,
                    released = summary.released,
                    "Leader lease lapsed mid-batch, released remaining claims"
                );
                break;
            }

            if !self
                .repository
                .touch_claim(message.id, &self.instance_id, Utc::now())
                .await?
            {
                warn!(
                    relay = %self.instance_id,
                    message_id = %message.id,
                    "Claim taken over by another relay, skipping message"
                );
                summary.claims_lost += 1;
                continue;
            }

            match self.process_message(message).await {
                MessageOutcome::Sent => summary.sent += 1,
                MessageOutcome::Failed => summary.failed += 1,
                MessageOutcome::Dead => summary.dead += 1,
                MessageOutcome::Unrecorded => {}
            }
        }

        debug!(relay = %self.instance_id, ?summary, "Relay cycle finished");
        Ok(summary)
    }

    /// Renew the lease; an error counts as lost leadership
    async fn still_leader(&self, guard: &mut L::Guard) -> bool {
        match self.leader_lock.renew(guard).await {
            Ok(held) => held,
            Err(e) => {
                warn!(relay = %self.instance_id, error = %e, "Leader lease renewal failed");
                false
            }
        }
    }

    async fn release_remaining(&self, remaining: &[OutboxMessage]) -> OutboxResult<u64> {
        let ids: Vec<Uuid> = remaining.iter().map(|m| m.id).collect();
        self.repository
            .release_claims(&self.instance_id, &ids)
            .await
    }

    async fn process_message(&self, message: &OutboxMessage) -> MessageOutcome {
        let attempts = message.attempts + 1;

        let encoded = BrokerEnvelope::from_outbox(message).and_then(|envelope| {
            envelope
                .encode()
                .map_err(|e| OutboxError::serialization(e.to_string()))
        });
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                let reason = format!("invalid payload: {e}");
                error!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %e,
                    "Outbox message payload cannot be published, dead-lettering"
                );
                return self
                    .record(
                        self
                            .repository
                            .mark_dead(message.id, &self.instance_id, attempts, &reason)
                            .await,
                        message,
                        MessageOutcome::Dead,
                        "invalid_payload",
                    );
            }
        };

        let topic = self.router.resolve(message);
        let published = match tokio::time::timeout(
            self.config.publish_timeout(),
            self.publisher.publish(topic, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::timeout(
                operations::PUBLISH,
                u64::try_from(self.config.publish_timeout().as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match published {
            Ok(()) => {
                metrics::messages_published_total().add(
                    1,
                    &[
                        KeyValue::new("topic", topic.to_string()),
                        KeyValue::new("message_type", message.message_type.clone()),
                    ],
                );
                log_outbox_operation(
                    operations::PUBLISH,
                    Some(message.id),
                    Some(&message.message_type),
                    "sent",
                    Some(topic),
                );
                self.record(
                    self.repository
                        .mark_sent(message.id, &self.instance_id, Utc::now())
                        .await,
                    message,
                    MessageOutcome::Sent,
                    "",
                )
            }
            Err(e) => self.handle_publish_failure(message, attempts, &e).await,
        }
    }

    async fn handle_publish_failure(
        &self,
        message: &OutboxMessage,
        attempts: u32,
        err: &BrokerError,
    ) -> MessageOutcome {
        let reason = err.to_string();
        match self.retry.schedule(attempts, Utc::now()) {
            RetryDecision::RetryAt {
                delay,
                next_attempt_at,
            } => {
                warn!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Publish failed, retry scheduled"
                );
                metrics::publish_failures_total().add(
                    1,
                    &[
                        KeyValue::new("message_type", message.message_type.clone()),
                        KeyValue::new("error_kind", err.kind()),
                    ],
                );
                self.record(
                    self.repository
                        .mark_failed(
                            message.id,
                            &self.instance_id,
                            attempts,
                            &reason,
                            next_attempt_at,
                        )
                        .await,
                    message,
                    MessageOutcome::Failed,
                    "",
                )
            }
            RetryDecision::Abandon => {
                error!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    attempts,
                    max_retries = self.retry.max_retries(),
                    error = %err,
                    "Publish retries exhausted, dead-lettering"
                );
                self.record(
                    self.repository
                        .mark_dead(message.id, &self.instance_id, attempts, &reason)
                        .await,
                    message,
                    MessageOutcome::Dead,
                    "retries_exhausted",
                )
            }
        }
    }

    fn record(
        &self,
        result: OutboxResult<()>,
        message: &OutboxMessage,
        outcome: MessageOutcome,
        dead_reason: &'static str,
    ) -> MessageOutcome {
        match result {
            Ok(()) => {
                if outcome == MessageOutcome::Dead {
                    metrics::messages_dead_total().add(
                        1,
                        &[
                            KeyValue::new("message_type", message.message_type.clone()),
                            KeyValue::new("reason", dead_reason),
                        ],
                    );
                }
                outcome
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    ?outcome,
                    "Failed to record outbox message outcome"
                );
                MessageOutcome::Unrecorded
            }
        }
    }

    /// Recover stale claims, then run cycles every `poll_delay` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            relay = %self.instance_id,
            poll_delay_seconds = self.config.poll_delay_seconds,
            batch_size = self.config.batch_size,
            lock_key = self.config.advisory_lock_key,
            "Starting outbox relay"
        );

        if let Err(e) = self.recover_stale().await {
            error!(relay = %self.instance_id, error = %e, "Startup stale-claim recovery failed");
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle(&cancel).await {
                Ok(RelayCycleOutcome::Completed(summary)) if summary.claimed > 0 => {
                    info!(
                        relay = %self.instance_id,
                        claimed = summary.claimed,
                        sent = summary.sent,
                        failed = summary.failed,
                        dead = summary.dead,
                        "Relay cycle completed"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(relay = %self.instance_id, error = %e, "Relay cycle failed"),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_delay()) => {}
            }
        }

        info!(relay = %self.instance_id, "Outbox relay stopped");
    }
}
