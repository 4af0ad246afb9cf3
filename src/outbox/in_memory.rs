//! # In-Memory Outbox Store
//!
//! A process-local outbox with the same atomicity contract as the
//! Postgres store: rows staged in an [`InMemoryUnitOfWork`] become visible
//! only when the unit of work commits, together with any domain writes
//! staged alongside them.

use super::repository::{OutboxRepository, StatusCounts};
use super::writer::OutboxWriter;
use crate::error::{OutboxError, OutboxResult};
use crate::models::{NewOutboxMessage, OutboxMessage};
use crate::state_machine::OutboxStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
struct StoredMessage {
    /// Commit order, breaks `created_at` ties when claiming
    sequence: u64,
    message: OutboxMessage,
}

#[derive(Debug, Default)]
struct StoreState {
    messages: HashMap<Uuid, StoredMessage>,
    dedup_index: HashMap<String, Uuid>,
    next_sequence: u64,
}

impl StoreState {
    fn message_mut(&mut self, id: Uuid) -> OutboxResult<&mut OutboxMessage> {
        self.messages
            .get_mut(&id)
            .map(|stored| &mut stored.message)
            .ok_or(OutboxError::MessageNotFound { id })
    }

    /// A processing row may only be finished by the relay that claimed it
    fn held_mut(&mut self, id: Uuid, holder: &str) -> OutboxResult<&mut OutboxMessage> {
        let message = self.message_mut(id)?;
        if message.status == OutboxStatus::Processing
            && message.claimed_by.as_deref() != Some(holder)
        {
            return Err(OutboxError::ClaimLost {
                id,
                holder: holder.to_string(),
            });
        }
        Ok(message)
    }
}

/// Shared in-memory outbox table
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a unit of work; nothing it stages is visible until `commit`
    pub fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            domain_writes: Vec::new(),
        }
    }

    /// Snapshot of every committed row, oldest first
    pub fn messages(&self) -> Vec<OutboxMessage> {
        let state = self.state.lock();
        let mut stored: Vec<&StoredMessage> = state.messages.values().collect();
        stored.sort_by_key(|s| (s.message.created_at, s.sequence));
        stored.into_iter().map(|s| s.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxStore {
    async fn claim_batch(
        &self,
        holder: &str,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        let mut state = self.state.lock();

        let mut candidates: Vec<(DateTime<Utc>, u64, Uuid)> = state
            .messages
            .values()
            .filter(|s| s.message.status == OutboxStatus::Pending)
            .map(|s| (s.message.created_at, s.sequence, s.message.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            let message = state.message_mut(id)?;
            message.claim(holder, now)?;
            claimed.push(message.clone());
        }
        Ok(claimed)
    }

    async fn touch_claim(&self, id: Uuid, holder: &str, now: DateTime<Utc>) -> OutboxResult<bool> {
        let mut state = self.state.lock();
        match state.messages.get_mut(&id) {
            Some(stored)
                if stored.message.status == OutboxStatus::Processing
                    && stored.message.claimed_by.as_deref() == Some(holder) =>
            {
                stored.message.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        holder: &str,
        processed_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        self.state
            .lock()
            .held_mut(id, holder)?
            .mark_sent(processed_at)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        self.state
            .lock()
            .held_mut(id, holder)?
            .mark_failed(attempts, error, next_attempt_at)
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> OutboxResult<()> {
        self.state
            .lock()
            .held_mut(id, holder)?
            .mark_dead(attempts, error)
    }

    async fn release_claims(&self, holder: &str, ids: &[Uuid]) -> OutboxResult<u64> {
        let mut state = self.state.lock();
        let mut released = 0;
        for id in ids {
            if let Some(stored) = state.messages.get_mut(id) {
                if stored.message.status == OutboxStatus::Processing
                    && stored.message.claimed_by.as_deref() == Some(holder)
                {
                    stored.message.release()?;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let mut state = self.state.lock();
        let mut recovered = 0;
        for stored in state.messages.values_mut() {
            if stored.message.is_stale(cutoff) {
                stored.message.release()?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_due(&self, now: DateTime<Utc>, limit: u32) -> OutboxResult<u64> {
        let mut state = self.state.lock();

        let mut due: Vec<(Option<DateTime<Utc>>, u64, Uuid)> = state
            .messages
            .values()
            .filter(|s| s.message.is_due(now))
            .map(|s| (s.message.next_attempt_at, s.sequence, s.message.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        for (_, _, id) in &due {
            state.message_mut(*id)?.requeue()?;
        }
        Ok(due.len() as u64)
    }

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxMessage>> {
        Ok(self
            .state
            .lock()
            .messages
            .get(&id)
            .map(|s| s.message.clone()))
    }

    async fn status_counts(&self) -> OutboxResult<StatusCounts> {
        let state = self.state.lock();
        let mut counts = StatusCounts::default();
        for stored in state.messages.values() {
            counts.add(stored.message.status, 1);
        }
        Ok(counts)
    }
}

type DomainWrite = Box<dyn FnOnce() + Send>;

/// Staged writes against an [`InMemoryOutboxStore`].
///
/// Dropping the unit of work without committing discards everything staged.
pub struct InMemoryUnitOfWork {
    state: Arc<Mutex<StoreState>>,
    staged: Vec<OutboxMessage>,
    domain_writes: Vec<DomainWrite>,
}

impl std::fmt::Debug for InMemoryUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryUnitOfWork")
            .field("staged", &self.staged.len())
            .field("domain_writes", &self.domain_writes.len())
            .finish()
    }
}

impl InMemoryUnitOfWork {
    /// Stage a domain mutation that runs only if this unit of work commits
    pub fn stage_domain_write(&mut self, write: impl FnOnce() + Send + 'static) {
        self.domain_writes.push(Box::new(write));
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Apply all staged rows and domain writes atomically.
    ///
    /// Deduplication keys are re-checked under the store lock, so a
    /// concurrent commit that took a key first fails this whole commit.
    pub fn commit(self) -> OutboxResult<Vec<Uuid>> {
        let Self {
            state,
            staged,
            domain_writes,
        } = self;

        let ids = {
            let mut state = state.lock();
            for message in &staged {
                if let Some(key) = &message.deduplication_key {
                    if state.dedup_index.contains_key(key) {
                        warn!(deduplication_key = %key, "Commit rejected: deduplication key taken concurrently");
                        return Err(OutboxError::duplicate_event(key.clone()));
                    }
                }
            }

            let mut ids = Vec::with_capacity(staged.len());
            for message in staged {
                state.next_sequence += 1;
                let sequence = state.next_sequence;
                if let Some(key) = &message.deduplication_key {
                    state.dedup_index.insert(key.clone(), message.id);
                }
                ids.push(message.id);
                state
                    .messages
                    .insert(message.id, StoredMessage { sequence, message });
            }
            ids
        };

        for write in domain_writes {
            write();
        }

        debug!(committed = ids.len(), "In-memory unit of work committed");
        Ok(ids)
    }

    /// Discard everything staged
    pub fn rollback(self) {
        debug!(
            discarded = self.staged.len(),
            "In-memory unit of work rolled back"
        );
    }
}

#[async_trait]
impl OutboxWriter for InMemoryUnitOfWork {
    async fn enqueue(&mut self, message: NewOutboxMessage) -> OutboxResult<Uuid> {
        if let Some(key) = &message.deduplication_key {
            let staged_dup = self
                .staged
                .iter()
                .any(|m| m.deduplication_key.as_deref() == Some(key.as_str()));
            if staged_dup || self.state.lock().dedup_index.contains_key(key) {
                return Err(OutboxError::duplicate_event(key.clone()));
            }
        }

        let message = message.into_message(Utc::now());
        let id = message.id;
        self.staged.push(message);
        Ok(id)
    }
}
