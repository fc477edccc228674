//! Notification Deduplicator.
//!
//! Turns accepted remote changes (and data problems) into user-facing
//! notices, at most one per key per window. Records are evicted lazily:
//! an expired record is replaced on its next hit, and the retained set is
//! capped with oldest-first eviction.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::errors::{Severity, SyncError};
use crate::model::{EntityId, EntityKind, EventName, MutationEvent, Namespace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Change {
        entity_kind: EntityKind,
        entity_id: EntityId,
        event: EventName,
    },
    Problem {
        message: String,
    },
}

impl DedupKey {
    pub fn for_event(event: &MutationEvent) -> Self {
        Self::Change {
            entity_kind: event.entity_kind,
            entity_id: event.entity_id.clone(),
            event: event.name(),
        }
    }

    pub fn for_error(error: &SyncError) -> Self {
        Self::Problem {
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub dedup_key: DedupKey,
    pub first_seen_at: Instant,
    pub suppressed_count: u32,
}

/// A notice for the host to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Change {
        namespace: Namespace,
        entity_kind: EntityKind,
        entity_id: EntityId,
        event: String,
        actor: Option<String>,
        at: DateTime<Utc>,
    },
    Problem {
        namespace: Namespace,
        #[serde(skip)]
        severity: Severity,
        message: String,
    },
}

impl Notice {
    pub fn change(namespace: Namespace, event: &MutationEvent) -> Self {
        Self::Change {
            namespace,
            entity_kind: event.entity_kind,
            entity_id: event.entity_id.clone(),
            event: event.name().to_string(),
            actor: event.actor.clone(),
            at: event.timestamp,
        }
    }

    pub fn problem(namespace: Namespace, error: &SyncError) -> Self {
        Self::Problem {
            namespace,
            severity: error.severity(),
            message: error.to_string(),
        }
    }
}

pub struct NotificationDeduplicator {
    window: Duration,
    max_records: usize,
    records: HashMap<DedupKey, NotificationRecord>,
    /// Insertion order, for oldest-first eviction. Entries whose record has
    /// since been replaced are skipped.
    order: VecDeque<(DedupKey, Instant)>,
}

impl NotificationDeduplicator {
    pub fn new(window: Duration, max_records: usize) -> Self {
        Self {
            window,
            max_records: max_records.max(1),
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Should a notice for `event` be shown?
    pub fn notify(&mut self, event: &MutationEvent, now: Instant) -> bool {
        self.admit(DedupKey::for_event(event), now)
    }

    /// Record a hit on `key`. Returns `true` when a visible notice is due.
    pub fn admit(&mut self, key: DedupKey, now: Instant) -> bool {
        if let Some(record) = self.records.get_mut(&key)
            && now.saturating_duration_since(record.first_seen_at) < self.window
        {
            record.suppressed_count += 1;
            return false;
        }

        // New key, or an expired record being replaced
        if !self.records.contains_key(&key) {
            while self.records.len() >= self.max_records {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        self.records.insert(
            key.clone(),
            NotificationRecord {
                dedup_key: key.clone(),
                first_seen_at: now,
                suppressed_count: 0,
            },
        );
        self.order.push_back((key, now));
        self.compact_order();
        true
    }

    pub fn record(&self, key: &DedupKey) -> Option<&NotificationRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, seen_at)) = self.order.pop_front() {
            let current = self
                .records
                .get(&key)
                .is_some_and(|r| r.first_seen_at == seen_at);
            if current {
                self.records.remove(&key);
                return true;
            }
        }
        false
    }

    /// Keep the order queue from outgrowing the records it indexes.
    fn compact_order(&mut self) {
        if self.order.len() > self.max_records * 2 {
            let records = &self.records;
            self.order.retain(|(key, seen_at)| {
                records
                    .get(key)
                    .is_some_and(|r| r.first_seen_at == *seen_at)
            });
        }
    }
}
