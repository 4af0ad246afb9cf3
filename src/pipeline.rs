//! # Outbox Pipeline Supervision
//!
//! Wires the background services together and owns their lifecycle:
//!
//! - one [`OutboxRelay`] (leader-guarded, so every replica can run one)
//! - one [`RetrySweep`]
//! - one [`InboundConsumer`] per consumed topic
//! - one deduplication pruner
//!
//! All services share a [`CancellationToken`]; [`OutboxPipeline::shutdown`]
//! cancels it and waits for every task to finish its current unit of work.

use crate::config::OutboxConfig;
use crate::consumer::{
    ConsumerStats, ConsumerStatsSnapshot, DeduplicationStore, InboundConsumer,
    PgDeduplicationStore,
};
use crate::dispatch::{IntegrationEventDispatcher, IntegrationEventRegistry};
use crate::error::{OutboxError, OutboxResult};
use crate::leader::{LeaderLock, PgAdvisoryLeaderLock};
use crate::messaging::{BrokerConsumer, BrokerPublisher, TopicRouter};
use crate::outbox::{OutboxRepository, PgOutboxStore};
use crate::relay::{OutboxRelay, RelayStats, RelayStatsSnapshot, RetrySweep};
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything the pipeline needs, with storage and broker chosen by the caller
pub struct PipelineComponents<L: LeaderLock> {
    pub config: OutboxConfig,
    pub repository: Arc<dyn OutboxRepository>,
    pub publisher: Arc<dyn BrokerPublisher>,
    pub consumer: Arc<dyn BrokerConsumer>,
    pub dedup_store: Arc<dyn DeduplicationStore>,
    pub leader_lock: L,
    pub registry: IntegrationEventRegistry,
}

pub struct OutboxPipeline {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
    relay_stats: Arc<RelayStats>,
    consumer_stats: HashMap<String, Arc<ConsumerStats>>,
}

impl std::fmt::Debug for OutboxPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPipeline")
            .field(
                "tasks",
                &self.tasks.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl OutboxPipeline {
    /// Validate configuration and spawn every background service.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<L>(components: PipelineComponents<L>) -> OutboxResult<Self>
    where
        L: LeaderLock + 'static,
    {
        let PipelineComponents {
            config,
            repository,
            publisher,
            consumer,
            dedup_store,
            leader_lock,
            registry,
        } = components;
        config.validate()?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&repository),
            publisher,
            leader_lock,
            TopicRouter::from_config(&config.topics),
            config.relay.clone(),
            &config.retry,
        ));
        let relay_stats = relay.stats();
        let token = cancel.clone();
        tasks.push((
            "outbox_relay".to_string(),
            tokio::spawn(async move { relay.run(token).await }),
        ));

        let sweep = RetrySweep::new(Arc::clone(&repository), config.retry.clone());
        let token = cancel.clone();
        tasks.push((
            "retry_sweep".to_string(),
            tokio::spawn(async move { sweep.run(token).await }),
        ));

        let dispatcher =
            IntegrationEventDispatcher::new(registry, config.consumer.processing_timeout());
        let mut consumer_stats = HashMap::new();
        for topic in config.topics.consumed_topics() {
            let inbound = InboundConsumer::new(
                topic.clone(),
                Arc::clone(&consumer),
                Arc::clone(&dedup_store),
                dispatcher.clone(),
                config.consumer.clone(),
            );
            consumer_stats.insert(topic.clone(), inbound.stats());
            let token = cancel.clone();
            tasks.push((
                format!("inbound_consumer:{topic}"),
                tokio::spawn(async move { inbound.run(token).await }),
            ));
        }

        let token = cancel.clone();
        let retention = config.consumer.dedup_retention();
        let prune_interval = config.consumer.dedup_prune_interval();
        tasks.push((
            "dedup_pruner".to_string(),
            tokio::spawn(run_dedup_pruner(
                dedup_store,
                retention,
                prune_interval,
                token,
            )),
        ));

        info!(
            services = tasks.len(),
            topics = ?consumer_stats.keys().collect::<Vec<_>>(),
            "Outbox pipeline started"
        );

        Ok(Self {
            cancel,
            tasks,
            relay_stats,
            consumer_stats,
        })
    }

    /// Start against Postgres: outbox store, dedup store and advisory lock
    /// all share `pool`. The schema must already be migrated.
    pub fn start_postgres(
        config: OutboxConfig,
        pool: PgPool,
        publisher: Arc<dyn BrokerPublisher>,
        consumer: Arc<dyn BrokerConsumer>,
        registry: IntegrationEventRegistry,
    ) -> OutboxResult<Self> {
        let reservation_timeout = config.consumer.processing_timeout() * 2;
        Self::start(PipelineComponents {
            repository: Arc::new(PgOutboxStore::new(pool.clone())),
            dedup_store: Arc::new(PgDeduplicationStore::new(pool.clone(), reservation_timeout)),
            leader_lock: PgAdvisoryLeaderLock::new(pool),
            publisher,
            consumer,
            registry,
            config,
        })
    }

    /// Token shared by every service; cancelling it stops the pipeline
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn relay_stats(&self) -> RelayStatsSnapshot {
        self.relay_stats.snapshot()
    }

    pub fn consumer_stats(&self, topic: &str) -> Option<ConsumerStatsSnapshot> {
        self.consumer_stats.get(topic).map(|stats| stats.snapshot())
    }

    /// Cancel every service and wait for them to stop
    pub async fn shutdown(self) -> OutboxResult<()> {
        info!("Shutting down outbox pipeline");
        self.cancel.cancel();

        let mut failed = Vec::new();
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!(service = %name, "Pipeline service stopped"),
                Err(e) => {
                    error!(service = %name, error = %e, "Pipeline service terminated abnormally");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            info!("Outbox pipeline stopped");
            Ok(())
        } else {
            Err(OutboxError::internal(format!(
                "pipeline services terminated abnormally: {}",
                failed.join(", ")
            )))
        }
    }
}

/// Forget deduplication entries older than the retention window
async fn run_dedup_pruner(
    store: Arc<dyn DeduplicationStore>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match store.prune(cutoff).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Pruned deduplication entries"),
            Err(e) => error!(error = %e, "Deduplication prune failed"),
        }
    }
}
