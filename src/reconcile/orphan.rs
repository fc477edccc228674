//! Holding area for child events that arrived before their parent.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use crate::errors::{Resource, SyncError};
use crate::model::{EntityRef, MutationEvent};

#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub event: MutationEvent,
    pub waiting_on: EntityRef,
    /// Retries already spent.
    pub attempts: u32,
    pub next_retry: Instant,
}

/// Bounded buffer of orphaned events with per-entry exponential backoff.
///
/// Full means full: a new orphan is refused rather than evicting an older
/// one, since eviction would silently lose data.
#[derive(Debug)]
pub struct OrphanBuffer {
    entries: VecDeque<OrphanEntry>,
    capacity: usize,
    max_retries: u32,
    backoff: Duration,
}

impl OrphanBuffer {
    pub fn new(capacity: usize, max_retries: u32, backoff: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            max_retries,
            backoff,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park `event` until `waiting_on` shows up.
    pub fn push(
        &mut self,
        event: MutationEvent,
        waiting_on: EntityRef,
        now: Instant,
    ) -> Result<(), SyncError> {
        if self.entries.len() >= self.capacity {
            return Err(SyncError::CapacityExceeded {
                resource: Resource::OrphanBuffer,
                limit: self.capacity,
            });
        }
        tracing::debug!(
            entity = %event.entity_ref(),
            parent = %waiting_on,
            server_seq = event.server_seq,
            "buffering orphan event"
        );
        self.entries.push_back(OrphanEntry {
            event,
            waiting_on,
            attempts: 0,
            next_retry: now + self.backoff,
        });
        Ok(())
    }

    /// Remove and return every event waiting on `parent`, oldest first.
    pub fn take_waiting_on(&mut self, parent: &EntityRef) -> Vec<OrphanEntry> {
        self.take_where(|entry| &entry.waiting_on == parent)
    }

    /// Remove and return entries whose retry time has come.
    pub fn take_due(&mut self, now: Instant) -> Vec<OrphanEntry> {
        self.take_where(|entry| entry.next_retry <= now)
    }

    /// Drop entries matching `predicate`, without surfacing errors.
    pub fn discard_where(&mut self, mut predicate: impl FnMut(&OrphanEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !predicate(entry));
        before - self.entries.len()
    }

    /// Put back an entry whose retry failed. Once the retry budget is spent
    /// the entry is dropped and reported.
    pub fn requeue(&mut self, mut entry: OrphanEntry, now: Instant) -> Option<SyncError> {
        entry.attempts += 1;
        if entry.attempts >= self.max_retries {
            tracing::warn!(
                entity = %entry.event.entity_ref(),
                parent = %entry.waiting_on,
                attempts = entry.attempts,
                "dropping orphan event"
            );
            return Some(SyncError::OrphanEvent {
                entity_kind: entry.event.entity_kind,
                entity_id: entry.event.entity_id,
                parent_id: entry.waiting_on.id,
                attempts: entry.attempts,
            });
        }
        entry.next_retry = now + self.backoff * 2u32.saturating_pow(entry.attempts);
        // Requeued entries keep their place at the front of the line
        self.entries.push_front(entry);
        None
    }

    fn take_where(&mut self, mut predicate: impl FnMut(&OrphanEntry) -> bool) -> Vec<OrphanEntry> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry) {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }
}
