//! # Outbox Metrics
//!
//! OpenTelemetry instruments for the relay, retry sweep and inbound
//! consumers. The crate only records through the global meter provider;
//! installing an exporter is left to the host application.
//!
//! ```rust
//! use outbox_core::metrics;
//! use opentelemetry::KeyValue;
//!
//! metrics::messages_published_total().add(
//!     1,
//!     &[
//!         KeyValue::new("topic", "tasks"),
//!         KeyValue::new("message_type", "TaskCreated"),
//!     ],
//! );
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static OUTBOX_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    OUTBOX_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("outbox-core"))
}

// Relay

/// Outbox messages accepted by the broker
///
/// Labels:
/// - topic
/// - message_type
pub fn messages_published_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.messages.published.total")
        .with_description("Outbox messages accepted by the broker")
        .build()
}

/// Publish attempts that failed and were scheduled for retry
///
/// Labels:
/// - message_type
/// - error_kind: unavailable, rejected, timeout, unknown_delivery, decode
pub fn publish_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.messages.publish_failures.total")
        .with_description("Publish attempts that failed and were scheduled for retry")
        .build()
}

/// Messages moved to the dead state
///
/// Labels:
/// - message_type
/// - reason: retries_exhausted, invalid_payload
pub fn messages_dead_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.messages.dead.total")
        .with_description("Messages moved to the dead state")
        .build()
}

/// Processing rows reset to pending by the stale-claim sweep
pub fn messages_recovered_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.messages.recovered.total")
        .with_description("Stale processing rows reset to pending")
        .build()
}

/// Failed rows flipped back to pending by the retry sweep
pub fn messages_requeued_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.messages.requeued.total")
        .with_description("Failed rows requeued after backoff")
        .build()
}

/// Relay cycles by outcome
///
/// Labels:
/// - outcome: completed, skipped, error
pub fn relay_cycles_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.relay.cycles.total")
        .with_description("Relay cycles by outcome")
        .build()
}

/// Wall time of a relay cycle in milliseconds
pub fn relay_cycle_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("outbox.relay.cycle.duration")
        .with_description("Relay cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}

// Consumer

/// Deliveries discarded because their deduplication key was already processed
///
/// Labels:
/// - topic
pub fn deliveries_deduplicated_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.deliveries.deduplicated.total")
        .with_description("Deliveries discarded as duplicates")
        .build()
}

/// Deliveries that could not be decoded and were dropped
///
/// Labels:
/// - topic
pub fn deliveries_poisoned_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.deliveries.poisoned.total")
        .with_description("Undecodable deliveries dropped")
        .build()
}

/// Handler outcomes
///
/// Labels:
/// - message_type
/// - outcome: success, retryable_failure, permanent_failure
pub fn dispatch_outcomes_total() -> Counter<u64> {
    meter()
        .u64_counter("outbox.dispatch.outcomes.total")
        .with_description("Integration event handler outcomes")
        .build()
}

/// Handler duration in milliseconds
///
/// Labels:
/// - message_type
pub fn dispatch_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("outbox.dispatch.duration")
        .with_description("Integration event handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
