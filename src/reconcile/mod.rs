//! Reconciliation layer.
//!
//! Two stores are kept. The authoritative store only ever sees server
//! events and snapshots. The view is the authoritative store with every
//! pending optimistic mutation replayed on top, in submission order, and is
//! rebuilt whenever either side changes. Confirming or rolling back an
//! optimistic mutation therefore never needs an inverse operation.
//!
//! Every apply path is total: bad input is reported through
//! [`Reconciler::drain_issues`] and leaves both stores untouched.

pub mod optimistic;
pub mod orphan;
pub mod store;

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::time::{Duration, Instant};

use crate::errors::SyncError;
use crate::model::{
    EntityKind, EntityRecord, EntityRef, LocalId, MutationEvent, MutationKind, RoomKey,
    RoomSnapshot,
};
use crate::sync_config::SyncConfig;

pub use optimistic::{MutationStatus, OptimisticLedger, OptimisticOp, PendingOptimisticMutation};
pub use orphan::{OrphanBuffer, OrphanEntry};
pub use store::{Entity, EntityStore, SeqKey};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub optimistic_timeout: Duration,
    pub orphan_max_retries: u32,
    pub orphan_backoff: Duration,
    pub orphan_buffer: usize,
}

impl ReconcileSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            optimistic_timeout: config.optimistic_timeout(),
            orphan_max_retries: config.reconcile.orphan_max_retries,
            orphan_backoff: config.orphan_backoff(),
            orphan_buffer: config.reconcile.orphan_buffer,
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sequence number not newer than what is known; nothing changed.
    Stale,
    /// Parked until the parent shows up.
    Orphaned,
    /// Could not be applied or parked; an issue was recorded.
    Dropped,
}

/// A live event that changed authoritative state.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub event: MutationEvent,
    /// Local mutation this event confirmed, if any.
    pub confirmed: Option<LocalId>,
}

impl Accepted {
    /// Authored elsewhere, so worth telling the user about.
    pub fn is_remote(&self, local_user: Option<&str>) -> bool {
        if self.confirmed.is_some() {
            return false;
        }
        match (local_user, self.event.actor.as_deref()) {
            (Some(me), Some(actor)) => me != actor,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub applied: usize,
    pub stale: usize,
    pub pruned: usize,
    pub orphaned: usize,
}

enum Attempt {
    /// Carries the entity now present, for releasing its orphans.
    Applied(Option<EntityRef>),
    Stale,
    MissingParent(EntityRef),
}

pub struct Reconciler {
    settings: ReconcileSettings,
    local_user: Option<String>,
    authoritative: EntityStore,
    view: EntityStore,
    ledger: OptimisticLedger,
    orphans: OrphanBuffer,
    /// Room → epoch at which its resync began.
    resync: HashMap<RoomKey, u64>,
    /// Entity → epoch of the last live event that touched it.
    touched: HashMap<EntityRef, u64>,
    epoch: u64,
    issues: Vec<SyncError>,
    accepted: Vec<Accepted>,
    view_dirty: bool,
    /// Bumped on every view change.
    revision: u64,
}

impl Reconciler {
    pub fn new(settings: ReconcileSettings, local_user: Option<String>) -> Self {
        let orphans = OrphanBuffer::new(
            settings.orphan_buffer,
            settings.orphan_max_retries,
            settings.orphan_backoff,
        );
        Self {
            settings,
            local_user,
            authoritative: EntityStore::new(),
            view: EntityStore::new(),
            ledger: OptimisticLedger::new(),
            orphans,
            resync: HashMap::new(),
            touched: HashMap::new(),
            epoch: 0,
            issues: Vec::new(),
            accepted: Vec::new(),
            view_dirty: false,
            revision: 0,
        }
    }

    /// Authoritative state plus pending optimistic changes.
    pub fn view(&self) -> &EntityStore {
        &self.view
    }

    /// Server-confirmed state only.
    pub fn authoritative(&self) -> &EntityStore {
        &self.authoritative
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn local_user(&self) -> Option<&str> {
        self.local_user.as_deref()
    }

    pub fn pending(&self) -> &[PendingOptimisticMutation] {
        self.ledger.pending()
    }

    pub fn status(&self, local_id: &str) -> Option<MutationStatus> {
        self.ledger.status(local_id)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn drain_issues(&mut self) -> Vec<SyncError> {
        std::mem::take(&mut self.issues)
    }

    pub fn drain_accepted(&mut self) -> Vec<Accepted> {
        std::mem::take(&mut self.accepted)
    }

    /// Apply one live server event.
    pub fn apply(&mut self, event: MutationEvent, now: Instant) -> ApplyOutcome {
        let outcome = match self.attempt(&event) {
            Attempt::Applied(present) => {
                self.accept(event, true);
                if let Some(present) = present {
                    self.release_orphans(present, now);
                }
                ApplyOutcome::Applied
            }
            Attempt::Stale => {
                tracing::debug!(
                    entity = %event.entity_ref(),
                    server_seq = event.server_seq,
                    "duplicate or stale event ignored"
                );
                self.accept(event, false);
                ApplyOutcome::Stale
            }
            Attempt::MissingParent(parent) => match self.orphans.push(event, parent, now) {
                Ok(()) => ApplyOutcome::Orphaned,
                Err(err) => {
                    tracing::warn!(error = %err, "orphan buffer full, dropping event");
                    self.issues.push(err);
                    ApplyOutcome::Dropped
                }
            },
        };
        self.refresh_view();
        outcome
    }

    /// Merge a full room snapshot.
    ///
    /// Records not newer than what is known are skipped. When a resync was
    /// started for the room, entities in its scope that the snapshot omits
    /// are pruned unless a live event touched them after the resync began.
    pub fn apply_snapshot(&mut self, snapshot: RoomSnapshot, now: Instant) -> SnapshotReport {
        let mut report = SnapshotReport::default();

        if let Some(marker) = self.resync.remove(&snapshot.room) {
            let present: HashSet<EntityRef> = snapshot
                .entities
                .iter()
                .map(|r| EntityRef::new(r.kind, r.id.clone()))
                .collect();
            let absent: Vec<EntityRef> = self
                .authoritative
                .scope(&snapshot.room)
                .into_iter()
                .filter(|r| !present.contains(r))
                .filter(|r| self.touched.get(r).is_none_or(|touched| *touched <= marker))
                .collect();
            for key in absent {
                let removed = self.authoritative.remove_cascade(&key);
                report.pruned += removed.len();
                for r in removed {
                    self.touched.remove(&r);
                }
            }
        }

        let mut records = snapshot.entities;
        records.sort_by(|a, b| {
            depth(a.kind)
                .cmp(&depth(b.kind))
                .then_with(|| a.parent_id.cmp(&b.parent_id))
                .then_with(|| a.position.cmp(&b.position))
                .then_with(|| a.id.cmp(&b.id))
        });

        for record in records {
            let key = EntityRef::new(record.kind, record.id.clone());
            let known = self.authoritative.seq(&SeqKey::Entity(key.clone()));
            if known.is_some_and(|seq| record.server_seq <= seq) {
                tracing::debug!(
                    room = %snapshot.room,
                    entity = %key,
                    server_seq = record.server_seq,
                    "stale snapshot ignored"
                );
                report.stale += 1;
                continue;
            }

            if let Some(parent_kind) = record.kind.required_parent() {
                let Some(parent_id) = record.parent_id.clone() else {
                    self.issues.push(SyncError::MalformedEvent {
                        event: "board:state".to_string(),
                        reason: format!("{} without parentId", key),
                    });
                    continue;
                };
                let parent = EntityRef::new(parent_kind, parent_id);
                if !self.authoritative.contains(&parent) {
                    match self.orphans.push(record_event(record), parent, now) {
                        Ok(()) => report.orphaned += 1,
                        Err(err) => self.issues.push(err),
                    }
                    continue;
                }
            }

            let server_seq = record.server_seq;
            let unchanged_slot = self.authoritative.get(&key).is_some_and(|existing| {
                existing.parent_id == record.parent_id
                    && (!record.kind.is_positional() || existing.slot == record.position)
            });
            if unchanged_slot {
                self.authoritative.replace_data(&key, record.data, server_seq);
            } else {
                self.authoritative.place(Entity::from(record));
            }
            self.authoritative.set_seq(SeqKey::Entity(key.clone()), server_seq);
            report.applied += 1;
            self.release_orphans(key, now);
        }

        tracing::info!(
            room = %snapshot.room,
            applied = report.applied,
            stale = report.stale,
            pruned = report.pruned,
            orphaned = report.orphaned,
            "snapshot merged"
        );
        self.view_dirty = true;
        self.refresh_view();
        report
    }

    /// Mark the start of a (re)join of `room`; the next snapshot for it may prune.
    pub fn begin_resync(&mut self, room: RoomKey) {
        tracing::debug!(room = %room, epoch = self.epoch, "resync started");
        self.resync.insert(room, self.epoch);
    }

    /// Record a local change and apply it to the view right away.
    pub fn apply_optimistic(
        &mut self,
        local_id: impl Into<LocalId>,
        op: OptimisticOp,
        now: Instant,
    ) -> PendingOptimisticMutation {
        let mutation = PendingOptimisticMutation::new(local_id, op, now);
        self.refresh_view();
        if mutation.apply_to(&mut self.view) {
            self.revision += 1;
        } else {
            tracing::debug!(local_id = %mutation.local_id, "optimistic change has no target yet");
        }
        self.ledger.push(mutation.clone());
        mutation
    }

    /// Roll back a mutation the server refused.
    pub fn reject(&mut self, local_id: &str, reason: &str) -> bool {
        let Some(rejected) = self.ledger.reject(local_id) else {
            return false;
        };
        tracing::warn!(local_id = %rejected.local_id, reason, "optimistic change rejected");
        self.issues.push(SyncError::MutationRejected {
            local_id: rejected.local_id,
            reason: reason.to_string(),
        });
        self.view_dirty = true;
        self.refresh_view();
        true
    }

    /// Roll back every optimistic change older than the confirmation window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.ledger.expire(now, self.settings.optimistic_timeout);
        for mutation in &expired {
            tracing::warn!(
                local_id = %mutation.local_id,
                entity = %mutation.entity_ref(),
                "optimistic change timed out, rolling back"
            );
            self.issues.push(SyncError::OptimisticTimeout {
                local_id: mutation.local_id.clone(),
                entity_kind: mutation.entity_kind,
                entity_id: mutation.entity_id.clone(),
            });
        }
        if !expired.is_empty() {
            self.view_dirty = true;
            self.refresh_view();
        }
        expired.len()
    }

    /// Periodic work: retry due orphans, then expire stale optimistic changes.
    pub fn tick(&mut self, now: Instant) {
        for entry in self.orphans.take_due(now) {
            self.retry(entry, now);
        }
        self.expire(now);
        self.refresh_view();
    }

    /// Forget everything belonging to rooms nobody holds any more: pending
    /// changes, resync markers, orphans waiting on the room, and the
    /// authoritative entities themselves.
    pub fn discard_rooms(&mut self, rooms: &[RoomKey]) -> usize {
        if rooms.is_empty() {
            return 0;
        }
        let view = &self.view;
        let discarded = self
            .ledger
            .reject_where(|p| pending_room(view, p).is_some_and(|room| rooms.contains(&room)));

        let mut removed_refs = Vec::new();
        for room in rooms {
            self.resync.remove(room);
            if let Some(root) = room.root() {
                removed_refs.extend(self.authoritative.remove_cascade(&root));
                self.authoritative.forget_seq(&SeqKey::Order(root.clone()));
                removed_refs.push(root);
            }
        }
        let removed: HashSet<EntityRef> = removed_refs.into_iter().collect();
        for key in &removed {
            self.touched.remove(key);
            self.authoritative.forget_seq(&SeqKey::Entity(key.clone()));
        }
        self.orphans
            .discard_where(|entry| removed.contains(&entry.waiting_on));

        tracing::debug!(
            rooms = rooms.len(),
            discarded = discarded.len(),
            entities = removed.len(),
            "rooms discarded"
        );
        self.view_dirty = true;
        self.refresh_view();
        discarded.len()
    }

    fn attempt(&mut self, event: &MutationEvent) -> Attempt {
        let seq = event.server_seq;
        if event.kind == MutationKind::Reordered {
            let board = EntityRef::new(EntityKind::Board, event.entity_id.clone());
            let lane = SeqKey::Order(board.clone());
            if self.is_stale(&lane, seq) {
                return Attempt::Stale;
            }
            if !self.authoritative.contains(&board) {
                return Attempt::MissingParent(board);
            }
            self.authoritative
                .reorder(event.entity_kind, &event.entity_id, &event.order);
            self.authoritative.set_seq(lane, seq);
            return Attempt::Applied(None);
        }

        let key = event.entity_ref();
        let lane = SeqKey::Entity(key.clone());
        if self.is_stale(&lane, seq) {
            return Attempt::Stale;
        }

        if event.kind == MutationKind::Deleted {
            let removed = self.authoritative.remove_cascade(&key);
            for r in &removed {
                self.touched.remove(r);
            }
            let stranded = self
                .orphans
                .discard_where(|entry| removed.contains(&entry.waiting_on));
            if stranded > 0 {
                tracing::debug!(entity = %key, stranded, "discarded orphans of deleted entity");
            }
            self.authoritative.set_seq(lane, seq);
            return Attempt::Applied(None);
        }

        let existing = self.authoritative.get(&key).cloned();
        let parent_id = event
            .parent_id
            .clone()
            .or_else(|| existing.as_ref().and_then(|e| e.parent_id.clone()));

        if let Some(parent_kind) = event.entity_kind.required_parent() {
            let Some(parent_id) = &parent_id else {
                // An update for something never seen; wait for its create
                return Attempt::MissingParent(key);
            };
            let parent = EntityRef::new(parent_kind, parent_id.clone());
            if !self.authoritative.contains(&parent) {
                return Attempt::MissingParent(parent);
            }
        }

        match (event.kind, existing) {
            (MutationKind::Updated, Some(_)) => {
                self.authoritative.replace_data(&key, event.data.clone(), seq);
            }
            (kind, existing) => {
                let kept_slot = existing
                    .filter(|e| kind != MutationKind::Moved && e.parent_id == parent_id)
                    .and_then(|e| e.slot);
                self.authoritative.place(Entity {
                    kind: event.entity_kind,
                    id: event.entity_id.clone(),
                    parent_id,
                    position: event.position.or(kept_slot),
                    slot: None,
                    server_seq: seq,
                    data: event.data.clone(),
                    optimistic: false,
                });
            }
        }
        self.authoritative.set_seq(lane, seq);
        Attempt::Applied(Some(key))
    }

    fn is_stale(&self, lane: &SeqKey, seq: u64) -> bool {
        self.authoritative.seq(lane).is_some_and(|known| seq <= known)
    }

    /// Attribute `event` to a pending local change. Applied events are also
    /// recorded for notification.
    fn accept(&mut self, event: MutationEvent, applied: bool) {
        let confirmed = self.ledger.attribute(&event, self.local_user.as_deref());
        if let Some(mutation) = &confirmed {
            tracing::debug!(
                local_id = %mutation.local_id,
                entity = %event.entity_ref(),
                server_seq = event.server_seq,
                "optimistic change confirmed"
            );
            if mutation.entity_id != event.entity_id
                && matches!(mutation.op, OptimisticOp::Create { .. })
            {
                self.ledger
                    .rename(event.entity_kind, &mutation.entity_id, &event.entity_id);
            }
            self.view_dirty = true;
        }

        if applied {
            self.epoch += 1;
            self.touched.insert(event.entity_ref(), self.epoch);
            self.view_dirty = true;
            self.accepted.push(Accepted {
                event,
                confirmed: confirmed.map(|m| m.local_id),
            });
        }
    }

    fn release_orphans(&mut self, parent: EntityRef, now: Instant) {
        let mut ready = VecDeque::from([parent]);
        while let Some(parent) = ready.pop_front() {
            for entry in self.orphans.take_waiting_on(&parent) {
                if let Some(present) = self.retry(entry, now) {
                    ready.push_back(present);
                }
            }
        }
    }

    /// Retry a parked event. Returns the entity it made present, if any.
    fn retry(&mut self, mut entry: OrphanEntry, now: Instant) -> Option<EntityRef> {
        match self.attempt(&entry.event) {
            Attempt::Applied(present) => {
                tracing::debug!(entity = %entry.event.entity_ref(), "orphan event applied");
                self.accept(entry.event, true);
                present
            }
            Attempt::Stale => {
                self.accept(entry.event, false);
                None
            }
            Attempt::MissingParent(parent) => {
                entry.waiting_on = parent;
                if let Some(err) = self.orphans.requeue(entry, now) {
                    self.issues.push(err);
                }
                None
            }
        }
    }

    fn refresh_view(&mut self) {
        if !self.view_dirty {
            return;
        }
        let mut view = self.authoritative.clone();
        for mutation in self.ledger.pending() {
            mutation.apply_to(&mut view);
        }
        self.view = view;
        self.view_dirty = false;
        self.revision += 1;
    }
}

/// Parents before children when merging a snapshot.
fn depth(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::Workspace | EntityKind::Board => 0,
        EntityKind::Space | EntityKind::Member | EntityKind::Column | EntityKind::Tag => 1,
        EntityKind::Task => 2,
    }
}

fn record_event(record: EntityRecord) -> MutationEvent {
    let mut event = MutationEvent::new(
        MutationKind::Updated,
        record.kind,
        record.id,
        record.server_seq,
    );
    event.parent_id = record.parent_id;
    event.position = record.position;
    event.data = record.data;
    event
}

/// Room a pending change belongs to, judged from the view.
fn pending_room(view: &EntityStore, mutation: &PendingOptimisticMutation) -> Option<RoomKey> {
    if let Some(room) = view.room_of(&mutation.entity_ref()) {
        return Some(room);
    }
    let (kind, parent_id) = match &mutation.op {
        OptimisticOp::Create {
            kind,
            parent_id: Some(parent_id),
            ..
        } => (*kind, parent_id),
        OptimisticOp::Move {
            entity, parent_id, ..
        } => (entity.kind, parent_id),
        _ => return None,
    };
    let parent_kind = kind.required_parent()?;
    view.room_of(&EntityRef::new(parent_kind, parent_id.clone()))
}
