//! Normalized entity store.
//!
//! Entities are keyed by `(kind, id)`. Positional kinds (columns, tasks) keep
//! contiguous positions `0..n` inside their container after every write. The
//! order inside a container is derived only from the stored records (declared
//! slot, then sequence, then id), never from arrival order.
//! Per-entity sequence numbers live alongside and outlive deletes.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{EntityId, EntityKind, EntityRecord, EntityRef, RoomKey};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub kind: EntityKind,
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub position: Option<u32>,
    /// Position as last declared for this entity; `position` is its rank.
    #[serde(skip)]
    pub slot: Option<u32>,
    pub server_seq: u64,
    pub data: Map<String, Value>,
    /// Carries an unconfirmed local change.
    pub optimistic: bool,
}

impl Entity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }

    /// The entity this one must hang under, if its kind requires one.
    pub fn parent_ref(&self) -> Option<EntityRef> {
        let kind = self.kind.required_parent()?;
        let id = self.parent_id.as_ref()?;
        Some(EntityRef::new(kind, id.clone()))
    }
}

impl From<EntityRecord> for Entity {
    fn from(record: EntityRecord) -> Self {
        Self {
            kind: record.kind,
            id: record.id,
            parent_id: record.parent_id,
            position: record.position,
            slot: record.position,
            server_seq: record.server_seq,
            data: record.data,
            optimistic: false,
        }
    }
}

/// Key of an idempotency lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeqKey {
    Entity(EntityRef),
    /// Column order of a board, sequenced apart from the board itself.
    Order(EntityRef),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStore {
    entities: BTreeMap<EntityRef, Entity>,
    seqs: HashMap<SeqKey, u64>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityRef) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: &EntityRef) -> Option<&mut Entity> {
        self.entities.get_mut(key)
    }

    pub fn contains(&self, key: &EntityRef) -> bool {
        self.entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| e.kind == kind)
    }

    /// Last applied sequence number for a lane, including deleted entities.
    pub fn seq(&self, key: &SeqKey) -> Option<u64> {
        self.seqs.get(key).copied()
    }

    pub fn set_seq(&mut self, key: SeqKey, seq: u64) {
        self.seqs.insert(key, seq);
    }

    pub(crate) fn forget_seq(&mut self, key: &SeqKey) {
        self.seqs.remove(key);
    }

    /// Children of `kind` inside `parent_id`, in container order.
    ///
    /// Ties on the declared slot go to the unconfirmed local change first,
    /// then the higher sequence number, then the smaller id.
    pub fn children(&self, kind: EntityKind, parent_id: &str) -> Vec<&Entity> {
        let mut children: Vec<_> = self
            .entities
            .values()
            .filter(|e| e.kind == kind && e.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| {
            a.slot
                .unwrap_or(u32::MAX)
                .cmp(&b.slot.unwrap_or(u32::MAX))
                .then_with(|| b.optimistic.cmp(&a.optimistic))
                .then_with(|| b.server_seq.cmp(&a.server_seq))
                .then_with(|| a.id.cmp(&b.id))
        });
        children
    }

    /// Ids of `kind` inside `parent_id`, in position order.
    pub fn ordered_ids(&self, kind: EntityKind, parent_id: &str) -> Vec<EntityId> {
        self.children(kind, parent_id)
            .into_iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Insert or replace `entity`. `entity.position` is taken as its declared
    /// slot; without one it goes after the last sibling. Old and new
    /// containers are renumbered afterwards.
    pub fn place(&mut self, mut entity: Entity) {
        let key = entity.entity_ref();
        let previous = self.entities.remove(&key);

        if !entity.kind.is_positional() {
            self.entities.insert(key, entity);
            return;
        }

        if let Some(old) = previous
            && let Some(old_parent) = old.parent_id
            && entity.parent_id.as_ref() != Some(&old_parent)
        {
            self.renumber(entity.kind, &old_parent);
        }

        let Some(parent_id) = entity.parent_id.clone() else {
            entity.position = None;
            entity.slot = None;
            self.entities.insert(key, entity);
            return;
        };

        let kind = entity.kind;
        entity.slot = Some(match entity.position {
            Some(position) => position,
            None => self.next_slot(kind, &parent_id),
        });
        self.entities.insert(key, entity);
        self.renumber(kind, &parent_id);
    }

    /// Replace an entity's fields without touching its container or position.
    pub fn replace_data(&mut self, key: &EntityRef, data: Map<String, Value>, server_seq: u64) -> bool {
        match self.entities.get_mut(key) {
            Some(entity) => {
                entity.data = data;
                entity.server_seq = server_seq;
                entity.optimistic = false;
                true
            }
            None => false,
        }
    }

    /// Remove an entity and everything under it. Returns what was removed,
    /// the entity itself first.
    pub fn remove_cascade(&mut self, key: &EntityRef) -> Vec<EntityRef> {
        let Some(root) = self.entities.remove(key) else {
            return Vec::new();
        };

        let mut removed = vec![key.clone()];
        let mut index = 0;
        while index < removed.len() {
            let parent = removed[index].clone();
            let children: Vec<EntityRef> = self
                .entities
                .values()
                .filter(|e| e.parent_ref().as_ref() == Some(&parent))
                .map(Entity::entity_ref)
                .collect();
            for child in children {
                self.entities.remove(&child);
                removed.push(child);
            }
            index += 1;
        }

        if root.kind.is_positional()
            && let Some(parent_id) = &root.parent_id
        {
            self.renumber(root.kind, parent_id);
        }
        removed
    }

    /// Everything under `key`, not including `key`.
    pub fn descendants(&self, key: &EntityRef) -> Vec<EntityRef> {
        let mut found = vec![key.clone()];
        let mut index = 0;
        while index < found.len() {
            let parent = found[index].clone();
            found.extend(
                self.entities
                    .values()
                    .filter(|e| e.parent_ref().as_ref() == Some(&parent))
                    .map(Entity::entity_ref),
            );
            index += 1;
        }
        found.remove(0);
        found
    }

    /// Apply an explicit column order to a board. Listed columns come first in
    /// the given order; unlisted ones keep their relative order after them.
    pub fn reorder(&mut self, kind: EntityKind, parent_id: &str, order: &[EntityId]) {
        let current = self.ordered_ids(kind, parent_id);
        let mut next: Vec<EntityId> = Vec::with_capacity(current.len());
        for id in order {
            if current.contains(id) && !next.contains(id) {
                next.push(id.clone());
            }
        }
        for id in current {
            if !next.contains(&id) {
                next.push(id);
            }
        }
        for (index, id) in next.iter().enumerate() {
            if let Some(entity) = self.entities.get_mut(&EntityRef::new(kind, id.clone())) {
                entity.slot = Some(index as u32);
            }
        }
        self.renumber(kind, parent_id);
    }

    /// The room whose scope contains `key`, found by walking up parents.
    pub fn room_of(&self, key: &EntityRef) -> Option<RoomKey> {
        let mut current = key.clone();
        // Bounded by hierarchy depth
        for _ in 0..4 {
            match current.kind {
                EntityKind::Board => return Some(RoomKey::board(&current.id)),
                EntityKind::Workspace => return Some(RoomKey::workspace(&current.id)),
                _ => {
                    let entity = self.entities.get(&current)?;
                    current = entity.parent_ref()?;
                }
            }
        }
        None
    }

    /// The room root plus everything under it.
    pub fn scope(&self, room: &RoomKey) -> Vec<EntityRef> {
        let Some(root) = room.root() else {
            return Vec::new();
        };
        if !self.contains(&root) {
            return Vec::new();
        }
        let mut scope = vec![root.clone()];
        scope.extend(self.descendants(&root));
        scope
    }

    fn next_slot(&self, kind: EntityKind, parent_id: &str) -> u32 {
        self.children(kind, parent_id)
            .iter()
            .filter_map(|e| e.slot)
            .max()
            .map_or(0, |slot| slot.saturating_add(1))
    }

    fn renumber(&mut self, kind: EntityKind, parent_id: &str) {
        let ids = self.ordered_ids(kind, parent_id);
        for (index, id) in ids.into_iter().enumerate() {
            if let Some(entity) = self.entities.get_mut(&EntityRef::new(kind, id)) {
                entity.position = Some(index as u32);
            }
        }
    }
}
