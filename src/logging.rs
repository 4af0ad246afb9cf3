//! # Structured Logging Module
//!
//! Environment-aware console logging built on `tracing-subscriber`.
//! Logs go to stdout; set `OUTBOX_LOG_FORMAT=json` for machine-readable
//! output. `RUST_LOG` overrides the environment-derived level.

use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once; later calls are no-ops.
///
/// Does not fail if the host application already installed a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("OUTBOX_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
            return;
        }

        tracing::info!(
            environment = %environment,
            json = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("OUTBOX_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log one outbox lifecycle operation
pub fn log_outbox_operation(
    operation: &str,
    message_id: Option<Uuid>,
    message_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        message_id = ?message_id,
        message_type = message_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "OUTBOX_OPERATION"
    );
}

/// Log one inbound delivery decision
pub fn log_delivery_operation(
    topic: &str,
    deduplication_key: &str,
    message_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        topic = %topic,
        deduplication_key = %deduplication_key,
        message_type = message_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "DELIVERY_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_by_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_outbox_operation("enqueue", Some(Uuid::new_v4()), Some("TaskCreated"), "staged", None);
    }
}
