//! # Integration Event Dispatcher
//!
//! Resolves the handler for a consumed envelope and runs it under the
//! processing timeout. Every failure mode maps onto a handling result:
//!
//! | Condition              | Result             |
//! |------------------------|--------------------|
//! | No handler registered  | `PermanentFailure` |
//! | Handler timed out      | `RetryableFailure` |
//! | Dispatch cancelled     | `RetryableFailure` |
//! | Handler returned       | handler's result   |

use super::registry::{IntegrationEventHandler, IntegrationEventRegistry};
use super::result::IntegrationEventHandlingResult;
use crate::messaging::BrokerEnvelope;
use crate::metrics;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct IntegrationEventDispatcher {
    handlers: Arc<HashMap<String, Arc<dyn IntegrationEventHandler>>>,
    processing_timeout: Duration,
}

impl std::fmt::Debug for IntegrationEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationEventDispatcher")
            .field("handlers", &self.handlers.len())
            .field("processing_timeout", &self.processing_timeout)
            .finish()
    }
}

impl IntegrationEventDispatcher {
    pub fn new(registry: IntegrationEventRegistry, processing_timeout: Duration) -> Self {
        Self {
            handlers: Arc::new(registry.into_handlers()),
            processing_timeout,
        }
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    pub async fn dispatch(
        &self,
        envelope: &BrokerEnvelope,
        cancel: &CancellationToken,
    ) -> IntegrationEventHandlingResult {
        let message_type = envelope.message_type.as_str();

        let Some(handler) = self.handlers.get(message_type) else {
            warn!(
                message_id = %envelope.message_id,
                message_type = %message_type,
                "No handler registered for integration event type"
            );
            let result = IntegrationEventHandlingResult::permanent(format!(
                "no handler registered for {message_type}"
            ));
            record_outcome(message_type, &result);
            return result;
        };

        let started = Instant::now();
        // Already cancelled deliveries skip the handler but still count as an outcome
        let result = if cancel.is_cancelled() {
            IntegrationEventHandlingResult::retryable("dispatch cancelled")
        } else {
            self.run_handler(handler.as_ref(), envelope, cancel).await
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::dispatch_duration().record(
            elapsed_ms,
            &[KeyValue::new("message_type", message_type.to_string())],
        );
        record_outcome(message_type, &result);

        debug!(
            message_id = %envelope.message_id,
            message_type = %message_type,
            correlation_id = envelope.correlation_id(),
            outcome = result.outcome(),
            elapsed_ms,
            "Integration event dispatched"
        );
        result
    }

    async fn run_handler(
        &self,
        handler: &dyn IntegrationEventHandler,
        envelope: &BrokerEnvelope,
        cancel: &CancellationToken,
    ) -> IntegrationEventHandlingResult {
        let message_type = envelope.message_type.as_str();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                IntegrationEventHandlingResult::retryable("dispatch cancelled")
            }
            handled = tokio::time::timeout(self.processing_timeout, handler.handle(envelope)) => {
                match handled {
                    Ok(result) => result,
                    Err(_) => {
                        error!(
                            message_id = %envelope.message_id,
                            message_type = %message_type,
                            timeout_ms = u64::try_from(self.processing_timeout.as_millis()).unwrap_or(u64::MAX),
                            "Integration event handler timed out"
                        );
                        IntegrationEventHandlingResult::retryable(format!(
                            "handler timed out after {}ms",
                            self.processing_timeout.as_millis()
                        ))
                    }
                }
            }
        }
    }
}

fn record_outcome(message_type: &str, result: &IntegrationEventHandlingResult) {
    metrics::dispatch_outcomes_total().add(
        1,
        &[
            KeyValue::new("message_type", message_type.to_string()),
            KeyValue::new("outcome", result.outcome()),
        ],
    );
}
