//! # Inbound Deduplication
//!
//! Consume-side seen-set, independent from the outbox's own unique key.
//! A delivery reserves its deduplication key before dispatch; the
//! reservation is then either completed (processed) or released so a
//! redelivery can try again.

use crate::error::OutboxResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupState {
    InFlight,
    Processed,
}

impl DedupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Processed => "processed",
        }
    }
}

impl std::str::FromStr for DedupState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(Self::InFlight),
            "processed" => Ok(Self::Processed),
            other => Err(format!("Invalid deduplication state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationRecord {
    pub deduplication_key: String,
    pub state: DedupState,
    pub reserved_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// This delivery owns the key and should dispatch
    Reserved,
    /// Handled before; acknowledge and discard
    AlreadyProcessed,
    /// Another delivery is handling it right now
    InFlight,
}

#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn try_reserve(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<ReserveOutcome>;

    async fn mark_processed(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<()>;

    /// Drop an in-flight reservation so a redelivery can reserve it again
    async fn release(&self, key: &str) -> OutboxResult<()>;

    /// Forget entries older than `older_than`
    async fn prune(&self, older_than: DateTime<Utc>) -> OutboxResult<u64>;

    async fn get(&self, key: &str) -> OutboxResult<Option<DeduplicationRecord>>;
}

/// DashMap-backed seen-set.
///
/// In-flight reservations older than `reservation_timeout` can be taken
/// over, so a delivery abandoned mid-dispatch does not block its key
/// forever.
#[derive(Debug, Clone)]
pub struct InMemoryDeduplicationStore {
    records: Arc<DashMap<String, DeduplicationRecord>>,
    reservation_timeout: chrono::Duration,
}

impl InMemoryDeduplicationStore {
    pub fn new(reservation_timeout: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            reservation_timeout: chrono::Duration::from_std(reservation_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn fresh_reservation(key: &str, now: DateTime<Utc>) -> DeduplicationRecord {
        DeduplicationRecord {
            deduplication_key: key.to_string(),
            state: DedupState::InFlight,
            reserved_at: now,
            processed_at: None,
        }
    }
}

impl Default for InMemoryDeduplicationStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    async fn try_reserve(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<ReserveOutcome> {
        match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Self::fresh_reservation(key, now));
                Ok(ReserveOutcome::Reserved)
            }
            Entry::Occupied(mut occupied) => {
                let (state, reserved_at) = {
                    let record = occupied.get();
                    (record.state, record.reserved_at)
                };
                match state {
                    DedupState::Processed => Ok(ReserveOutcome::AlreadyProcessed),
                    DedupState::InFlight
                        if now.signed_duration_since(reserved_at) > self.reservation_timeout =>
                    {
                        occupied.insert(Self::fresh_reservation(key, now));
                        Ok(ReserveOutcome::Reserved)
                    }
                    DedupState::InFlight => Ok(ReserveOutcome::InFlight),
                }
            }
        }
    }

    async fn mark_processed(&self, key: &str, now: DateTime<Utc>) -> OutboxResult<()> {
        self.records
            .entry(key.to_string())
            .and_modify(|record| {
                record.state = DedupState::Processed;
                record.processed_at = Some(now);
            })
            .or_insert_with(|| DeduplicationRecord {
                deduplication_key: key.to_string(),
                state: DedupState::Processed,
                reserved_at: now,
                processed_at: Some(now),
            });
        Ok(())
    }

    async fn release(&self, key: &str) -> OutboxResult<()> {
        self.records
            .remove_if(key, |_, record| record.state == DedupState::InFlight);
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| {
            let last_touched = record.processed_at.unwrap_or(record.reserved_at);
            last_touched >= older_than
        });
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    async fn get(&self, key: &str) -> OutboxResult<Option<DeduplicationRecord>> {
        Ok(self.records.get(key).map(|record| record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_reserve_complete_and_repeat() {
        let store = InMemoryDeduplicationStore::default();
        let now = Utc::now();

        assert_eq!(
            store.try_reserve("task-1", now).await.unwrap(),
            ReserveOutcome::Reserved
        );
        assert_eq!(
            store.try_reserve("task-1", now).await.unwrap(),
            ReserveOutcome::InFlight
        );

        store.mark_processed("task-1", now).await.unwrap();
        assert_eq!(
            store.try_reserve("task-1", now).await.unwrap(),
            ReserveOutcome::AlreadyProcessed
        );

        // Releasing a processed key is a no-op
        store.release("task-1").await.unwrap();
        assert_eq!(
            store.get("task-1").await.unwrap().unwrap().state,
            DedupState::Processed
        );
    }

    #[tokio::test]
    async fn test_release_allows_new_reservation() {
        let store = InMemoryDeduplicationStore::default();
        let now = Utc::now();
        store.try_reserve("task-1", now).await.unwrap();
        store.release("task-1").await.unwrap();
        assert_eq!(
            store.try_reserve("task-1", now).await.unwrap(),
            ReserveOutcome::Reserved
        );
    }

    #[tokio::test]
    async fn test_abandoned_reservation_taken_over() {
        let store = InMemoryDeduplicationStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.try_reserve("task-1", now).await.unwrap();

        let later = now + ChronoDuration::seconds(61);
        assert_eq!(
            store.try_reserve("task-1", later).await.unwrap(),
            ReserveOutcome::Reserved
        );
    }

    #[tokio::test]
    async fn test_prune_by_age() {
        let store = InMemoryDeduplicationStore::default();
        let old = Utc::now() - ChronoDuration::days(8);
        let recent = Utc::now();
        store.mark_processed("old", old).await.unwrap();
        store.mark_processed("recent", recent).await.unwrap();

        let pruned = store
            .prune(Utc::now() - ChronoDuration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("recent").await.unwrap().is_some());
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("in_flight".parse::<DedupState>().unwrap(), DedupState::InFlight);
        assert!("done".parse::<DedupState>().is_err());
    }
}
