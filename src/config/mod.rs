//! # Outbox Configuration System
//!
//! Typed, validated configuration for every stage of the delivery pipeline.
//! Values come from [`ConfigManager`], which layers built-in defaults, TOML
//! files and `OUTBOX__`-prefixed environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().relay.batch_size;
//! let max_retries = manager.config().retry.max_retries;
//! # Ok(())
//! # }
//! ```
//!
//! ## File layout
//!
//! ```toml
//! [relay]
//! poll_delay_seconds = 2.0
//! batch_size = 100
//! advisory_lock_key = 7_300_114_001
//!
//! [retry]
//! max_retries = 3
//! initial_delay_seconds = 1.0
//! backoff_multiplier = 2.0
//!
//! [consumer]
//! max_concurrency = 8
//! processing_timeout_seconds = 30.0
//!
//! [topics]
//! default_topic = "integration-events"
//!
//! [[topics.routes]]
//! message_type = "TaskCreated"
//! topic = "tasks"
//! ```

pub mod error;
pub mod loader;

use crate::constants::defaults;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/outbox.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Database connection settings for the Postgres-backed stores
    pub database: DatabaseConfig,

    /// Outbox relay (publisher) settings
    pub relay: RelayConfig,

    /// Backoff and retry settings
    pub retry: RetryConfig,

    /// Inbound consumer and deduplication settings
    pub consumer: ConsumerConfig,

    /// Event type to broker topic routing
    pub topics: TopicConfig,
}

impl OutboxConfig {
    /// Validate every section, returning the first violation found
    pub fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.relay.validate()?;
        self.retry.validate()?;
        self.consumer.validate()?;
        self.topics.validate()?;
        Ok(())
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL; falls back to `DATABASE_URL` when unset
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL from config or the `DATABASE_URL` variable
    pub fn database_url(&self) -> ConfigResult<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                ConfigurationError::missing_required_field("url", "database (or DATABASE_URL)")
            })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.max_connections,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Outbox relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Delay between relay cycles
    pub poll_delay_seconds: f64,
    /// Maximum rows claimed per cycle
    pub batch_size: u32,
    /// Fixed key of the single-leader lock shared by all relay replicas
    pub advisory_lock_key: i64,
    /// Lease lifetime for lease-based leader locks
    pub lease_ttl_seconds: f64,
    /// Processing rows claimed longer ago than this are reset to pending
    pub stale_processing_timeout_seconds: f64,
    /// Upper bound on a single broker publish
    pub publish_timeout_seconds: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_delay_seconds: 5.0,
            batch_size: 100,
            advisory_lock_key: defaults::ADVISORY_LOCK_KEY,
            lease_ttl_seconds: 30.0,
            stale_processing_timeout_seconds: 300.0,
            publish_timeout_seconds: 30.0,
        }
    }
}

impl RelayConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs_f64(self.poll_delay_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.lease_ttl_seconds)
    }

    pub fn stale_processing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_processing_timeout_seconds)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.publish_timeout_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        positive_seconds("relay.poll_delay_seconds", self.poll_delay_seconds)?;
        positive_seconds("relay.lease_ttl_seconds", self.lease_ttl_seconds)?;
        positive_seconds(
            "relay.stale_processing_timeout_seconds",
            self.stale_processing_timeout_seconds,
        )?;
        positive_seconds("relay.publish_timeout_seconds", self.publish_timeout_seconds)?;
        // Claims are refreshed right before each publish; a publish still in
        // flight must never look stale to another relay
        if self.stale_processing_timeout_seconds <= self.publish_timeout_seconds {
            return Err(ConfigurationError::invalid_value(
                "relay.stale_processing_timeout_seconds",
                self.stale_processing_timeout_seconds,
                "must exceed relay.publish_timeout_seconds",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "relay.batch_size",
                self.batch_size,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total publish attempts before a message is marked dead
    pub max_retries: u32,
    pub initial_delay_seconds: f64,
    pub backoff_multiplier: f64,
    /// Cap applied to any computed delay
    pub max_delay_seconds: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_max_percentage: f64,
    /// Interval of the sweep that requeues due failed messages
    pub sweep_interval_seconds: f64,
    pub sweep_batch_size: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_delay_seconds: 300.0,
            jitter_enabled: false,
            jitter_max_percentage: 0.1,
            sweep_interval_seconds: 15.0,
            sweep_batch_size: 500,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_delay_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_retries",
                self.max_retries,
                "must allow at least one attempt",
            ));
        }
        positive_seconds("retry.initial_delay_seconds", self.initial_delay_seconds)?;
        positive_seconds("retry.max_delay_seconds", self.max_delay_seconds)?;
        positive_seconds("retry.sweep_interval_seconds", self.sweep_interval_seconds)?;
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_multiplier",
                self.backoff_multiplier,
                "must be a finite value >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "retry.jitter_max_percentage",
                self.jitter_max_percentage,
                "must be between 0.0 and 1.0",
            ));
        }
        if self.sweep_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.sweep_batch_size",
                self.sweep_batch_size,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Inbound consumer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Deliveries dispatched concurrently per topic
    pub max_concurrency: usize,
    /// Upper bound on a single handler invocation
    pub processing_timeout_seconds: f64,
    /// Deliveries pulled from the broker per receive call
    pub receive_batch_size: usize,
    /// Sleep between receive calls when the topic is empty
    pub idle_poll_millis: u64,
    /// How long processed deduplication keys are remembered
    pub dedup_retention_seconds: u64,
    pub dedup_prune_interval_seconds: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            processing_timeout_seconds: 30.0,
            receive_batch_size: 32,
            idle_poll_millis: 250,
            dedup_retention_seconds: 7 * 24 * 60 * 60,
            dedup_prune_interval_seconds: 300,
        }
    }
}

impl ConsumerConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.processing_timeout_seconds)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_millis)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_seconds)
    }

    pub fn dedup_prune_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_prune_interval_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.max_concurrency",
                self.max_concurrency,
                "must be greater than zero",
            ));
        }
        if self.receive_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.receive_batch_size",
                self.receive_batch_size,
                "must be greater than zero",
            ));
        }
        positive_seconds(
            "consumer.processing_timeout_seconds",
            self.processing_timeout_seconds,
        )?;
        Ok(())
    }
}

/// One event type to topic mapping entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TopicRoute {
    pub message_type: String,
    pub topic: String,
}

/// Topic routing configuration
///
/// Routes are kept as a list rather than a table because configuration keys
/// are case-folded while event type names are not.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Topic used for event types without an explicit route
    pub default_topic: String,
    pub routes: Vec<TopicRoute>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            default_topic: defaults::DEFAULT_TOPIC.to_string(),
            routes: Vec::new(),
        }
    }
}

impl TopicConfig {
    /// Route table keyed by event type
    pub fn route_map(&self) -> HashMap<String, String> {
        self.routes
            .iter()
            .map(|route| (route.message_type.clone(), route.topic.clone()))
            .collect()
    }

    /// Every topic a consumer host should subscribe to, default topic first
    pub fn consumed_topics(&self) -> Vec<String> {
        let mut topics = vec![self.default_topic.clone()];
        for route in &self.routes {
            if !topics.contains(&route.topic) {
                topics.push(route.topic.clone());
            }
        }
        topics
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_topic.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "default_topic",
                "topics",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if route.topic.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    format!("topics.routes[{}].topic", route.message_type),
                    &route.topic,
                    "topic must not be empty",
                ));
            }
            if !seen.insert(route.message_type.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "topics.routes",
                    &route.message_type,
                    "event type is routed more than once",
                ));
            }
        }
        Ok(())
    }
}

fn positive_seconds(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be a positive number of seconds",
        ))
    }
}
