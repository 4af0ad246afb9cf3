//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered in order,
//! later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`OutboxConfig::default`])
//! 2. `{config_dir}/outbox.toml`
//! 3. `{config_dir}/outbox.{environment}.toml`
//! 4. Environment variables such as `OUTBOX__RELAY__BATCH_SIZE=50`

use super::error::{ConfigResult, ConfigurationError};
use super::OutboxConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "OUTBOX";

/// Separator between nested keys in environment overrides
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus the context it was loaded from
#[derive(Debug)]
pub struct ConfigManager {
    config: OutboxConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading outbox configuration"
        );

        let config = Self::build_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            batch_size = config.relay.batch_size,
            max_retries = config.retry.max_retries,
            max_concurrency = config.consumer.max_concurrency,
            topics = config.topics.consumed_topics().len(),
            "Outbox configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (validated before use)
    pub fn from_config(config: OutboxConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: PathBuf::from("config"),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Environment the configuration was loaded for
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Directory searched for configuration files
    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn build_config(config_directory: &Path, environment: &str) -> ConfigResult<OutboxConfig> {
        let defaults = Config::try_from(&OutboxConfig::default())
            .map_err(|e| ConfigurationError::load_error("defaults", e))?;

        let base_file = config_directory.join("outbox.toml");
        let env_file = config_directory.join(format!("outbox.{environment}.toml"));

        let built = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file.clone()).required(false))
            .add_source(File::from(env_file.clone()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                ConfigurationError::load_error(
                    format!("{} / {}", base_file.display(), env_file.display()),
                    e,
                )
            })?;

        built
            .try_deserialize::<OutboxConfig>()
            .map_err(|e| ConfigurationError::load_error("deserialize", e))
    }

    fn detect_environment() -> String {
        env::var("OUTBOX_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults_when_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().relay.batch_size, 100);
        assert_eq!(manager.config().retry.max_retries, 3);
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("outbox.toml"),
            r#"
[relay]
batch_size = 25
poll_delay_seconds = 1.5

[retry]
max_retries = 5

[[topics.routes]]
message_type = "TaskCreated"
topic = "tasks"
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("outbox.test.toml"),
            r#"
[relay]
batch_size = 10
"#,
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        let config = manager.config();

        assert_eq!(config.relay.batch_size, 10);
        assert_eq!(config.relay.poll_delay_seconds, 1.5);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.topics.route_map().get("TaskCreated").map(String::as_str),
            Some("tasks")
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("outbox.toml"),
            r#"
[consumer]
max_concurrency = 0
"#,
        )
        .unwrap();

        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
