//! Ledger of locally applied, unconfirmed mutations.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::{Duration, Instant};

use super::store::{Entity, EntityStore};
use crate::model::{EntityId, EntityKind, EntityRef, LocalId, MutationEvent, MutationKind};

/// Resolved statuses kept for lookups after a mutation leaves the ledger.
const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }
}

/// A local intent, applied to the view ahead of confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticOp {
    /// Create under `parent_id`; the local id doubles as the provisional entity id.
    Create {
        kind: EntityKind,
        parent_id: Option<EntityId>,
        position: Option<u32>,
        data: Map<String, Value>,
    },
    /// Overwrite the listed fields.
    Update {
        entity: EntityRef,
        fields: Map<String, Value>,
    },
    Move {
        entity: EntityRef,
        parent_id: EntityId,
        position: u32,
    },
    Delete {
        entity: EntityRef,
    },
}

impl OptimisticOp {
    pub fn mutation_kind(&self) -> MutationKind {
        match self {
            Self::Create { .. } => MutationKind::Created,
            Self::Update { .. } => MutationKind::Updated,
            Self::Move { .. } => MutationKind::Moved,
            Self::Delete { .. } => MutationKind::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOptimisticMutation {
    pub local_id: LocalId,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub op: OptimisticOp,
    pub submitted_at: Instant,
    pub status: MutationStatus,
}

impl PendingOptimisticMutation {
    pub fn new(local_id: impl Into<LocalId>, op: OptimisticOp, submitted_at: Instant) -> Self {
        let local_id = local_id.into();
        let (entity_kind, entity_id) = match &op {
            OptimisticOp::Create { kind, .. } => (*kind, local_id.clone()),
            OptimisticOp::Update { entity, .. }
            | OptimisticOp::Move { entity, .. }
            | OptimisticOp::Delete { entity } => (entity.kind, entity.id.clone()),
        };
        Self {
            local_id,
            entity_kind,
            entity_id,
            op,
            submitted_at,
            status: MutationStatus::Pending,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_kind, self.entity_id.clone())
    }

    /// Would `event`, sent by this client, be the server's echo of this mutation?
    fn is_echoed_by(&self, event: &MutationEvent) -> bool {
        if event.kind != self.op.mutation_kind() || event.entity_kind != self.entity_kind {
            return false;
        }
        match &self.op {
            OptimisticOp::Create { parent_id, .. } => event.parent_id == *parent_id,
            _ => event.entity_id == self.entity_id,
        }
    }

    /// Apply this mutation onto `view`. Total: a missing target makes it a no-op.
    pub fn apply_to(&self, view: &mut EntityStore) -> bool {
        match &self.op {
            OptimisticOp::Create {
                kind,
                parent_id,
                position,
                data,
            } => {
                if let Some(parent_kind) = kind.required_parent() {
                    let Some(parent_id) = parent_id else {
                        return false;
                    };
                    if !view.contains(&EntityRef::new(parent_kind, parent_id.clone())) {
                        return false;
                    }
                }
                view.place(Entity {
                    kind: *kind,
                    id: self.entity_id.clone(),
                    parent_id: parent_id.clone(),
                    position: *position,
                    slot: None,
                    server_seq: 0,
                    data: data.clone(),
                    optimistic: true,
                });
                true
            }
            OptimisticOp::Update { entity, fields } => match view.get_mut(entity) {
                Some(existing) => {
                    for (field, value) in fields {
                        existing.data.insert(field.clone(), value.clone());
                    }
                    existing.optimistic = true;
                    true
                }
                None => false,
            },
            OptimisticOp::Move {
                entity,
                parent_id,
                position,
            } => {
                let Some(mut moved) = view.get(entity).cloned() else {
                    return false;
                };
                if let Some(parent_kind) = entity.kind.required_parent()
                    && !view.contains(&EntityRef::new(parent_kind, parent_id.clone()))
                {
                    return false;
                }
                moved.parent_id = Some(parent_id.clone());
                moved.position = Some(*position);
                moved.optimistic = true;
                view.place(moved);
                true
            }
            OptimisticOp::Delete { entity } => !view.remove_cascade(entity).is_empty(),
        }
    }
}

/// Pending mutations in submission order, plus a short history of outcomes.
#[derive(Debug, Default)]
pub struct OptimisticLedger {
    pending: Vec<PendingOptimisticMutation>,
    history: VecDeque<(LocalId, MutationStatus)>,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: PendingOptimisticMutation) {
        self.pending.push(mutation);
    }

    pub fn pending(&self) -> &[PendingOptimisticMutation] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn status(&self, local_id: &str) -> Option<MutationStatus> {
        if self.pending.iter().any(|p| p.local_id == local_id) {
            return Some(MutationStatus::Pending);
        }
        self.history
            .iter()
            .rev()
            .find(|(id, _)| id == local_id)
            .map(|(_, status)| *status)
    }

    /// Find and remove the pending mutation `event` confirms.
    ///
    /// An echoed `clientRef` wins. Otherwise, for events the local user
    /// authored, the oldest pending mutation of the same shape is taken.
    pub fn attribute(
        &mut self,
        event: &MutationEvent,
        local_user: Option<&str>,
    ) -> Option<PendingOptimisticMutation> {
        let by_ref = event
            .client_ref
            .as_ref()
            .and_then(|client_ref| self.pending.iter().position(|p| &p.local_id == client_ref));

        let index = by_ref.or_else(|| {
            let own = local_user.is_some() && event.actor.as_deref() == local_user;
            if !own {
                return None;
            }
            self.pending.iter().position(|p| p.is_echoed_by(event))
        })?;

        let mut confirmed = self.pending.remove(index);
        confirmed.status = MutationStatus::Confirmed;
        self.record(&confirmed.local_id, MutationStatus::Confirmed);
        Some(confirmed)
    }

    /// Reject one mutation by local id.
    pub fn reject(&mut self, local_id: &str) -> Option<PendingOptimisticMutation> {
        let index = self.pending.iter().position(|p| p.local_id == local_id)?;
        let mut rejected = self.pending.remove(index);
        rejected.status = MutationStatus::Rejected;
        self.record(&rejected.local_id, MutationStatus::Rejected);
        Some(rejected)
    }

    /// Reject every mutation submitted at or before `now - timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingOptimisticMutation> {
        let expired: Vec<LocalId> = self
            .pending
            .iter()
            .filter(|p| now.saturating_duration_since(p.submitted_at) >= timeout)
            .map(|p| p.local_id.clone())
            .collect();
        expired.iter().filter_map(|id| self.reject(id)).collect()
    }

    /// Reject every mutation matching `predicate`.
    pub fn reject_where(
        &mut self,
        mut predicate: impl FnMut(&PendingOptimisticMutation) -> bool,
    ) -> Vec<PendingOptimisticMutation> {
        let ids: Vec<LocalId> = self
            .pending
            .iter()
            .filter(|p| predicate(p))
            .map(|p| p.local_id.clone())
            .collect();
        ids.iter().filter_map(|id| self.reject(id)).collect()
    }

    /// Point later mutations at the server id once a provisional create is confirmed.
    pub fn rename(&mut self, kind: EntityKind, from: &str, to: &str) {
        for p in &mut self.pending {
            if p.entity_kind == kind && p.entity_id == from {
                p.entity_id = to.to_string();
            }
            match &mut p.op {
                OptimisticOp::Update { entity, .. }
                | OptimisticOp::Move { entity, .. }
                | OptimisticOp::Delete { entity } => {
                    if entity.kind == kind && entity.id == from {
                        entity.id = to.to_string();
                    }
                }
                OptimisticOp::Create { .. } => {}
            }
            let child_parent = match &mut p.op {
                OptimisticOp::Create {
                    kind: child_kind,
                    parent_id: Some(parent_id),
                    ..
                } if child_kind.required_parent() == Some(kind) => Some(parent_id),
                OptimisticOp::Move { entity, parent_id, .. }
                    if entity.kind.required_parent() == Some(kind) =>
                {
                    Some(parent_id)
                }
                _ => None,
            };
            if let Some(parent_id) = child_parent
                && *parent_id == from
            {
                *parent_id = to.to_string();
            }
        }
    }

    fn record(&mut self, local_id: &str, status: MutationStatus) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((local_id.to_string(), status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn create_task(local_id: &str, column: &str, now: Instant) -> PendingOptimisticMutation {
        PendingOptimisticMutation::new(
            local_id,
            OptimisticOp::Create {
                kind: EntityKind::Task,
                parent_id: Some(column.into()),
                position: None,
                data: fields(json!({"title": "draft"})),
            },
            now,
        )
    }

    #[test]
    fn test_client_ref_attribution_wins() {
        let now = Instant::now();
        let mut ledger = OptimisticLedger::new();
        ledger.push(create_task("tmp-1", "c1", now));
        ledger.push(create_task("tmp-2", "c1", now));

        let event = MutationEvent::new(MutationKind::Created, EntityKind::Task, "t2", 1)
            .with_parent("c1")
            .with_client_ref("tmp-2");
        let confirmed = ledger.attribute(&event, None).unwrap();
        assert_eq!(confirmed.local_id, "tmp-2");
        assert_eq!(ledger.status("tmp-2"), Some(MutationStatus::Confirmed));
        assert_eq!(ledger.status("tmp-1"), Some(MutationStatus::Pending));
    }

    #[test]
    fn test_actor_attribution_takes_oldest_matching() {
        let now = Instant::now();
        let mut ledger = OptimisticLedger::new();
        ledger.push(create_task("tmp-1", "c2", now));
        ledger.push(create_task("tmp-2", "c1", now));
        ledger.push(create_task("tmp-3", "c1", now));

        let event = MutationEvent::new(MutationKind::Created, EntityKind::Task, "t9", 4)
            .with_parent("c1")
            .with_actor("me");
        assert!(ledger.attribute(&event, Some("someone-else")).is_none());
        let confirmed = ledger.attribute(&event, Some("me")).unwrap();
        assert_eq!(confirmed.local_id, "tmp-2");
    }

    #[test]
    fn test_expire_rejects_old_mutations() {
        let start = Instant::now();
        let mut ledger = OptimisticLedger::new();
        ledger.push(create_task("old", "c1", start));
        ledger.push(create_task("fresh", "c1", start + Duration::from_secs(8)));

        let expired = ledger.expire(start + Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].local_id, "old");
        assert_eq!(expired[0].status, MutationStatus::Rejected);
        assert_eq!(ledger.pending().len(), 1);
    }

    #[test]
    fn test_rename_follows_confirmed_create() {
        let now = Instant::now();
        let mut ledger = OptimisticLedger::new();
        ledger.push(PendingOptimisticMutation::new(
            "edit",
            OptimisticOp::Update {
                entity: EntityRef::new(EntityKind::Column, "tmp-col"),
                fields: Map::new(),
            },
            now,
        ));
        ledger.push(create_task("tmp-task", "tmp-col", now));

        ledger.rename(EntityKind::Column, "tmp-col", "c7");
        assert_eq!(ledger.pending()[0].entity_id, "c7");
        match &ledger.pending()[1].op {
            OptimisticOp::Create { parent_id, .. } => assert_eq!(parent_id.as_deref(), Some("c7")),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let now = Instant::now();
        let mut ledger = OptimisticLedger::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            let id = format!("m{}", i);
            ledger.push(create_task(&id, "c1", now));
            ledger.reject(&id);
        }
        assert_eq!(ledger.history.len(), HISTORY_LIMIT);
        assert_eq!(ledger.status("m0"), None);
        assert_eq!(
            ledger.status(&format!("m{}", HISTORY_LIMIT + 9)),
            Some(MutationStatus::Rejected)
        );
    }

    #[test]
    fn test_apply_skips_missing_parent() {
        let mut view = EntityStore::new();
        let pending = create_task("tmp-1", "c1", Instant::now());
        assert!(!pending.apply_to(&mut view));
        assert!(view.is_empty());
    }
}
