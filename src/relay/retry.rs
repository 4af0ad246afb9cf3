//! # Retry Scheduler
//!
//! Decides what happens to a message after a failed publish: retry after an
//! exponential backoff, or abandon it once the retry budget is spent.
//!
//! Backoff after the n-th failed attempt is
//! `initial_delay * backoff_multiplier^n`, capped at `max_delay`, with
//! optional symmetric jitter.

use crate::config::RetryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of a failed publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the message as failed until `next_attempt_at`
    RetryAt {
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted
    Abandon,
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    max_retries: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    jitter_enabled: bool,
    jitter_max_percentage: f64,
}

impl RetryScheduler {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_delay(),
            jitter_enabled: config.jitter_enabled,
            jitter_max_percentage: config.jitter_max_percentage,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Deterministic backoff for a message that has failed `attempts` times
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = if seconds.is_finite() {
            seconds.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Retry or abandon after the `attempts`-th failed publish
    pub fn schedule(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts >= self.max_retries {
            return RetryDecision::Abandon;
        }

        let mut delay = self.backoff_delay(attempts);
        if self.jitter_enabled {
            delay = self.apply_jitter(delay);
        }
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::RetryAt {
            delay,
            next_attempt_at: now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        use rand::Rng;

        let range = delay.as_secs_f64() * self.jitter_max_percentage;
        if range <= 0.0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.0..=range);
        let seconds = if rng.gen_bool(0.5) {
            delay.as_secs_f64() + jitter
        } else {
            (delay.as_secs_f64() - jitter).max(0.0)
        };
        Duration::from_secs_f64(seconds)
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler(max_retries: u32) -> RetryScheduler {
        RetryScheduler::new(&RetryConfig {
            max_retries,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_default_backoff_sequence() {
        let scheduler = RetryScheduler::default();
        assert_eq!(scheduler.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(scheduler.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(scheduler.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(scheduler.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let scheduler = RetryScheduler::default();
        assert_eq!(scheduler.backoff_delay(20), Duration::from_secs(300));
        assert_eq!(scheduler.backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_abandon_at_max_retries() {
        let scheduler = scheduler(3);
        let now = Utc::now();

        match scheduler.schedule(2, now) {
            RetryDecision::RetryAt {
                delay,
                next_attempt_at,
            } => {
                assert_eq!(delay, Duration::from_secs(4));
                assert_eq!(next_attempt_at, now + chrono::Duration::seconds(4));
            }
            RetryDecision::Abandon => panic!("expected a retry"),
        }
        assert_eq!(scheduler.schedule(3, now), RetryDecision::Abandon);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let scheduler = RetryScheduler::new(&RetryConfig {
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
            max_retries: 10,
            ..RetryConfig::default()
        });
        let now = Utc::now();
        for _ in 0..50 {
            let RetryDecision::RetryAt { delay, .. } = scheduler.schedule(3, now) else {
                panic!("expected a retry");
            };
            assert!(delay >= Duration::from_secs_f64(7.19));
            assert!(delay <= Duration::from_secs_f64(8.81));
        }
    }

    proptest! {
        #[test]
        fn prop_backoff_follows_exponential_law(
            initial in 0.1f64..10.0,
            multiplier in 1.0f64..4.0,
            attempts in 0u32..12,
        ) {
            let scheduler = RetryScheduler::new(&RetryConfig {
                initial_delay_seconds: initial,
                backoff_multiplier: multiplier,
                max_delay_seconds: 1.0e9,
                ..RetryConfig::default()
            });
            let expected = initial * multiplier.powi(attempts as i32);
            let actual = scheduler.backoff_delay(attempts).as_secs_f64();
            prop_assert!((actual - expected).abs() <= expected * 1e-9 + 1e-6);
        }

        #[test]
        fn prop_backoff_is_monotonic_and_bounded(attempts in 0u32..64) {
            let scheduler = RetryScheduler::default();
            let current = scheduler.backoff_delay(attempts);
            let next = scheduler.backoff_delay(attempts + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_secs(300));
        }
    }
}
