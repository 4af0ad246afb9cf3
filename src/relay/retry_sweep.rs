//! # Retry Sweep Background Service
//!
//! Low-frequency loop that flips failed outbox rows whose backoff elapsed
//! back to pending. It never publishes; the relay picks requeued rows up on
//! its next cycle.

use crate::config::RetryConfig;
use crate::error::OutboxResult;
use crate::metrics;
use crate::outbox::OutboxRepository;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct RetrySweep {
    repository: Arc<dyn OutboxRepository>,
    config: RetryConfig,
}

impl std::fmt::Debug for RetrySweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySweep")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrySweep {
    pub fn new(repository: Arc<dyn OutboxRepository>, config: RetryConfig) -> Self {
        Self { repository, config }
    }

    /// Requeue one batch of due rows
    pub async fn sweep_once(&self) -> OutboxResult<u64> {
        let requeued = self
            .repository
            .requeue_due(Utc::now(), self.config.sweep_batch_size)
            .await?;

        if requeued > 0 {
            metrics::messages_requeued_total().add(requeued, &[]);
            info!(requeued, "Requeued failed outbox messages");
        } else {
            debug!("No failed outbox messages due for retry");
        }
        Ok(requeued)
    }

    /// Sweep every `sweep_interval` until cancelled.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_seconds = self.config.sweep_interval_seconds,
            batch_size = self.config.sweep_batch_size,
            "Starting retry sweep"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Retry sweep failed");
            }
        }

        info!("Retry sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewOutboxMessage;
    use crate::outbox::{InMemoryOutboxStore, OutboxWriter};
    use crate::state_machine::OutboxStatus;

    #[tokio::test]
    async fn test_sweep_requeues_only_due_rows() {
        let store = InMemoryOutboxStore::new();
        let mut uow = store.begin();
        let due = uow.enqueue(NewOutboxMessage::new("A", "{}")).await.unwrap();
        let later = uow.enqueue(NewOutboxMessage::new("B", "{}")).await.unwrap();
        uow.commit().unwrap();

        let now = Utc::now();
        store.claim_batch("relay-1", 10, now).await.unwrap();
        store
            .mark_failed(due, "relay-1", 1, "boom", now - chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .mark_failed(later, "relay-1", 1, "boom", now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let sweep = RetrySweep::new(Arc::new(store.clone()), RetryConfig::default());
        assert_eq!(sweep.sweep_once().await.unwrap(), 1);

        assert_eq!(
            store.find(due).await.unwrap().unwrap().status,
            OutboxStatus::Pending
        );
        assert_eq!(
            store.find(later).await.unwrap().unwrap().status,
            OutboxStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let sweep = RetrySweep::new(
            Arc::new(InMemoryOutboxStore::new()),
            RetryConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        sweep.run(cancel).await;
    }
}
