//! Inbound event vocabulary.
//!
//! Event names map to a statically known payload shape: mutation events decode
//! into [`MutationEvent`], `board:state` into [`RoomSnapshot`]. Anything else
//! (chat, ai, system traffic) is passed through as [`InboundEvent::Other`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{EntityId, EntityKind, EntityRef, LocalId, RoomKey};
use crate::errors::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    ColumnCreated,
    ColumnUpdated,
    ColumnDeleted,
    ColumnMoved,
    ColumnsReordered,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskMoved,
    TagCreated,
    TagUpdated,
    TagDeleted,
    BoardState,
    WorkspaceUpdated,
    MemberAdded,
    MemberRemoved,
    MemberRoleChanged,
    OwnershipTransferred,
    SpaceCreated,
    SpaceUpdated,
    /// The server refused a client mutation.
    MutationRejected,
    Other(String),
}

impl EventName {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ColumnCreated => "column:created",
            Self::ColumnUpdated => "column:updated",
            Self::ColumnDeleted => "column:deleted",
            Self::ColumnMoved => "column:moved",
            Self::ColumnsReordered => "columns:reordered",
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskDeleted => "task:deleted",
            Self::TaskMoved => "task:moved",
            Self::TagCreated => "board:tag:created",
            Self::TagUpdated => "board:tag:updated",
            Self::TagDeleted => "board:tag:deleted",
            Self::BoardState => "board:state",
            Self::WorkspaceUpdated => "workspace:updated",
            Self::MemberAdded => "workspace:member_added",
            Self::MemberRemoved => "workspace:member_removed",
            Self::MemberRoleChanged => "workspace:role_changed",
            Self::OwnershipTransferred => "workspace:ownership_transferred",
            Self::SpaceCreated => "workspace:space_created",
            Self::SpaceUpdated => "workspace:space_updated",
            Self::MutationRejected => "mutation:rejected",
            Self::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "column:created" => Self::ColumnCreated,
            "column:updated" => Self::ColumnUpdated,
            "column:deleted" => Self::ColumnDeleted,
            "column:moved" => Self::ColumnMoved,
            "columns:reordered" => Self::ColumnsReordered,
            "task:created" => Self::TaskCreated,
            "task:updated" => Self::TaskUpdated,
            "task:deleted" => Self::TaskDeleted,
            "task:moved" => Self::TaskMoved,
            "board:tag:created" => Self::TagCreated,
            "board:tag:updated" => Self::TagUpdated,
            "board:tag:deleted" => Self::TagDeleted,
            "board:state" => Self::BoardState,
            "workspace:updated" => Self::WorkspaceUpdated,
            "workspace:member_added" => Self::MemberAdded,
            "workspace:member_removed" => Self::MemberRemoved,
            "workspace:role_changed" | "workspace:member_role_changed" => Self::MemberRoleChanged,
            "workspace:ownership_transferred" => Self::OwnershipTransferred,
            "workspace:space_created" => Self::SpaceCreated,
            "workspace:space_updated" => Self::SpaceUpdated,
            "mutation:rejected" => Self::MutationRejected,
            other => Self::Other(other.to_string()),
        }
    }

    /// The structural change an event name stands for, if it is a mutation.
    pub fn mutation_shape(&self) -> Option<(MutationKind, EntityKind)> {
        use EntityKind as K;
        use MutationKind as M;
        let shape = match self {
            Self::ColumnCreated => (M::Created, K::Column),
            Self::ColumnUpdated => (M::Updated, K::Column),
            Self::ColumnDeleted => (M::Deleted, K::Column),
            Self::ColumnMoved => (M::Moved, K::Column),
            Self::ColumnsReordered => (M::Reordered, K::Column),
            Self::TaskCreated => (M::Created, K::Task),
            Self::TaskUpdated => (M::Updated, K::Task),
            Self::TaskDeleted => (M::Deleted, K::Task),
            Self::TaskMoved => (M::Moved, K::Task),
            Self::TagCreated => (M::Created, K::Tag),
            Self::TagUpdated => (M::Updated, K::Tag),
            Self::TagDeleted => (M::Deleted, K::Tag),
            Self::WorkspaceUpdated | Self::OwnershipTransferred => (M::Updated, K::Workspace),
            Self::MemberAdded => (M::Created, K::Member),
            Self::MemberRemoved => (M::Deleted, K::Member),
            Self::MemberRoleChanged => (M::Updated, K::Member),
            Self::SpaceCreated => (M::Created, K::Space),
            Self::SpaceUpdated => (M::Updated, K::Space),
            Self::BoardState | Self::MutationRejected | Self::Other(_) => return None,
        };
        Some(shape)
    }

    /// Canonical event name for a mutation shape.
    pub fn for_mutation(kind: MutationKind, entity_kind: EntityKind) -> Self {
        use EntityKind as K;
        use MutationKind as M;
        match (kind, entity_kind) {
            (M::Created, K::Column) => Self::ColumnCreated,
            (M::Updated, K::Column) => Self::ColumnUpdated,
            (M::Deleted, K::Column) => Self::ColumnDeleted,
            (M::Moved, K::Column) => Self::ColumnMoved,
            (M::Reordered, K::Column) => Self::ColumnsReordered,
            (M::Created, K::Task) => Self::TaskCreated,
            (M::Updated, K::Task) => Self::TaskUpdated,
            (M::Deleted, K::Task) => Self::TaskDeleted,
            (M::Moved, K::Task) => Self::TaskMoved,
            (M::Created, K::Tag) => Self::TagCreated,
            (M::Updated, K::Tag) => Self::TagUpdated,
            (M::Deleted, K::Tag) => Self::TagDeleted,
            (M::Updated, K::Workspace) => Self::WorkspaceUpdated,
            (M::Created, K::Member) => Self::MemberAdded,
            (M::Deleted, K::Member) => Self::MemberRemoved,
            (M::Updated, K::Member) => Self::MemberRoleChanged,
            (M::Created, K::Space) => Self::SpaceCreated,
            (M::Updated, K::Space) => Self::SpaceUpdated,
            (kind, entity_kind) => Self::Other(format!("{}:{}", entity_kind, kind.as_str())),
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
    Moved,
    Reordered,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Moved => "moved",
            Self::Reordered => "reordered",
        }
    }
}

/// Authoritative, server-issued structural change. Immutable once received.
///
/// Create, update and move events carry the entity's complete field set in
/// `data`, so applying the highest `server_seq` for an entity is enough to
/// converge regardless of arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    /// Name it arrived under. Several names can share one shape.
    pub event: EventName,
    pub kind: MutationKind,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    /// Containing entity; for moves, the target container.
    pub parent_id: Option<EntityId>,
    /// Target position for creates and moves.
    pub position: Option<u32>,
    pub data: Map<String, Value>,
    /// Child ids in their new order, for `columns:reordered`.
    pub order: Vec<EntityId>,
    pub server_seq: u64,
    pub actor: Option<String>,
    /// Provisional id echoed back for the originating client.
    pub client_ref: Option<LocalId>,
    pub timestamp: DateTime<Utc>,
}

impl MutationEvent {
    pub fn new(
        kind: MutationKind,
        entity_kind: EntityKind,
        entity_id: impl Into<EntityId>,
        server_seq: u64,
    ) -> Self {
        Self {
            event: EventName::for_mutation(kind, entity_kind),
            kind,
            entity_kind,
            entity_id: entity_id.into(),
            parent_id: None,
            position: None,
            data: Map::new(),
            order: Vec::new(),
            server_seq,
            actor: None,
            client_ref: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<EntityId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn with_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        self.order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_client_ref(mut self, local_id: impl Into<LocalId>) -> Self {
        self.client_ref = Some(local_id.into());
        self
    }

    pub fn name(&self) -> EventName {
        self.event.clone()
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_kind, self.entity_id.clone())
    }

    /// Decode a mutation payload for a known mutation event name.
    pub fn decode(name: &EventName, payload: Value) -> Result<Self, SyncError> {
        let Some((kind, entity_kind)) = name.mutation_shape() else {
            return Err(malformed(name, "not a mutation event"));
        };
        let wire: MutationWire =
            serde_json::from_value(payload).map_err(|e| malformed(name, &e.to_string()))?;

        let entity_id = wire
            .entity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed(name, "missing entityId"))?;
        let server_seq = wire
            .server_seq
            .ok_or_else(|| malformed(name, "missing serverSeq"))?;

        match kind {
            MutationKind::Moved => {
                if wire.parent_id.is_none() {
                    return Err(malformed(name, "move without target parentId"));
                }
                if wire.position.is_none() {
                    return Err(malformed(name, "move without position"));
                }
            }
            MutationKind::Reordered if wire.order.is_none() => {
                return Err(malformed(name, "reorder without order"));
            }
            MutationKind::Created
                if entity_kind.required_parent().is_some() && wire.parent_id.is_none() =>
            {
                return Err(malformed(name, "create without parentId"));
            }
            _ => {}
        }

        Ok(Self {
            event: name.clone(),
            kind,
            entity_kind,
            entity_id,
            parent_id: wire.parent_id,
            position: wire.position,
            data: wire.data.unwrap_or_default(),
            order: wire.order.unwrap_or_default(),
            server_seq,
            actor: wire.actor,
            client_ref: wire.client_ref,
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        })
    }

    /// Wire payload for this event, as a server would broadcast it.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "entityId": self.entity_id,
            "serverSeq": self.server_seq,
            "data": self.data,
            "timestamp": self.timestamp,
        });
        if let Value::Object(map) = &mut payload {
            if let Some(parent) = &self.parent_id {
                map.insert("parentId".into(), json!(parent));
            }
            if let Some(position) = self.position {
                map.insert("position".into(), json!(position));
            }
            if !self.order.is_empty() {
                map.insert("order".into(), json!(self.order));
            }
            if let Some(actor) = &self.actor {
                map.insert("actor".into(), json!(actor));
            }
            if let Some(client_ref) = &self.client_ref {
                map.insert("clientRef".into(), json!(client_ref));
            }
        }
        payload
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationWire {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    server_seq: Option<u64>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    client_ref: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    position: Option<u32>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    order: Option<Vec<String>>,
}

/// One entity inside a `board:state` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    pub server_seq: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Full authoritative dump of one room's entities, pushed on (re)join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: RoomKey,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

impl RoomSnapshot {
    fn decode(payload: Value) -> Result<Self, SyncError> {
        let snapshot: RoomSnapshot = serde_json::from_value(payload)
            .map_err(|e| malformed(&EventName::BoardState, &e.to_string()))?;
        if let Some(bad) = snapshot.entities.iter().find(|e| e.id.is_empty()) {
            return Err(malformed(
                &EventName::BoardState,
                &format!("{} record with empty id", bad.kind),
            ));
        }
        Ok(snapshot)
    }
}

/// Server refusal of a mutation this client submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRejection {
    pub client_ref: LocalId,
    #[serde(default)]
    pub reason: String,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Mutation(MutationEvent),
    Snapshot(RoomSnapshot),
    Rejection(MutationRejection),
    Other { name: String, payload: Value },
}

impl InboundEvent {
    pub fn decode(name: &str, payload: Value) -> Result<Self, SyncError> {
        let event_name = EventName::parse(name);
        match event_name {
            EventName::BoardState => RoomSnapshot::decode(payload).map(Self::Snapshot),
            EventName::MutationRejected => serde_json::from_value(payload)
                .map(Self::Rejection)
                .map_err(|e| malformed(&EventName::MutationRejected, &e.to_string())),
            EventName::Other(name) => Ok(Self::Other { name, payload }),
            known => MutationEvent::decode(&known, payload).map(Self::Mutation),
        }
    }

    pub fn name(&self) -> EventName {
        match self {
            Self::Mutation(event) => event.name(),
            Self::Snapshot(_) => EventName::BoardState,
            Self::Rejection(_) => EventName::MutationRejected,
            Self::Other { name, .. } => EventName::Other(name.clone()),
        }
    }
}

fn malformed(name: &EventName, reason: &str) -> SyncError {
    SyncError::MalformedEvent {
        event: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_parse_known_and_unknown() {
        assert_eq!(EventName::parse("task:moved"), EventName::TaskMoved);
        assert_eq!(EventName::parse("board:tag:deleted"), EventName::TagDeleted);
        assert_eq!(
            EventName::parse("chat:message"),
            EventName::Other("chat:message".to_string())
        );
        assert_eq!(EventName::TaskMoved.as_str(), "task:moved");
    }

    #[test]
    fn test_for_mutation_inverts_shape() {
        for name in [
            EventName::ColumnCreated,
            EventName::TaskMoved,
            EventName::ColumnsReordered,
            EventName::MemberAdded,
            EventName::SpaceUpdated,
        ] {
            let (kind, entity_kind) = name.mutation_shape().unwrap();
            assert_eq!(EventName::for_mutation(kind, entity_kind), name);
        }
    }

    #[test]
    fn test_decode_task_created() {
        let payload = json!({
            "entityId": "t1",
            "parentId": "c1",
            "serverSeq": 1,
            "clientRef": "tmp-1",
            "actor": "u1",
            "position": 0,
            "data": {"title": "Write tests"}
        });
        let event = InboundEvent::decode("task:created", payload).unwrap();
        let InboundEvent::Mutation(m) = event else {
            panic!("Expected mutation");
        };
        assert_eq!(m.kind, MutationKind::Created);
        assert_eq!(m.entity_kind, EntityKind::Task);
        assert_eq!(m.entity_id, "t1");
        assert_eq!(m.client_ref.as_deref(), Some("tmp-1"));
        assert_eq!(m.data["title"], "Write tests");
    }

    #[test]
    fn test_decode_keeps_the_wire_name() {
        let payload = json!({"entityId": "w1", "serverSeq": 4, "data": {"ownerId": "u2"}});
        let InboundEvent::Mutation(m) =
            InboundEvent::decode("workspace:ownership_transferred", payload).unwrap()
        else {
            panic!("Expected mutation");
        };
        assert_eq!(m.kind, MutationKind::Updated);
        assert_eq!(m.entity_kind, EntityKind::Workspace);
        assert_eq!(m.name(), EventName::OwnershipTransferred);
        assert_eq!(m.name().as_str(), "workspace:ownership_transferred");
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let err = InboundEvent::decode("task:updated", json!({"serverSeq": 2})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { .. }));
        assert!(err.to_string().contains("entityId"));

        let err = InboundEvent::decode("task:updated", json!({"entityId": "t1"})).unwrap_err();
        assert!(err.to_string().contains("serverSeq"));

        let err = InboundEvent::decode(
            "task:moved",
            json!({"entityId": "t1", "serverSeq": 3, "parentId": "c2"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("position"));

        let err = InboundEvent::decode(
            "task:created",
            json!({"entityId": "t1", "serverSeq": 1}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("parentId"));
    }

    #[test]
    fn test_decode_rejects_wrong_types() {
        let err =
            InboundEvent::decode("task:updated", json!({"entityId": 5, "serverSeq": 1})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { .. }));
    }

    #[test]
    fn test_decode_board_state() {
        let payload = json!({
            "room": "board:1",
            "entities": [
                {"kind": "board", "id": "1", "serverSeq": 4, "data": {"name": "Roadmap"}},
                {"kind": "column", "id": "c1", "parentId": "1", "position": 0, "serverSeq": 2}
            ]
        });
        let InboundEvent::Snapshot(snapshot) = InboundEvent::decode("board:state", payload).unwrap()
        else {
            panic!("Expected snapshot");
        };
        assert_eq!(snapshot.room, RoomKey::board("1"));
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.entities[1].position, Some(0));
    }

    #[test]
    fn test_decode_snapshot_with_bad_room_is_malformed() {
        let err = InboundEvent::decode("board:state", json!({"room": "nope"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { .. }));
    }

    #[test]
    fn test_decode_rejection() {
        let event =
            InboundEvent::decode("mutation:rejected", json!({"clientRef": "tmp-4", "reason": "forbidden"}))
                .unwrap();
        assert_eq!(
            event,
            InboundEvent::Rejection(MutationRejection {
                client_ref: "tmp-4".into(),
                reason: "forbidden".into()
            })
        );
        assert!(InboundEvent::decode("mutation:rejected", json!({})).is_err());
    }

    #[test]
    fn test_unknown_event_passes_through() {
        let event = InboundEvent::decode("ai:suggestion", json!({"text": "hi"})).unwrap();
        assert_eq!(event.name(), EventName::Other("ai:suggestion".into()));
    }

    #[test]
    fn test_to_payload_decodes_back() {
        let event = MutationEvent::new(MutationKind::Moved, EntityKind::Task, "t1", 7)
            .with_parent("c2")
            .with_position(3)
            .with_actor("u2");
        let decoded = MutationEvent::decode(&EventName::TaskMoved, event.to_payload()).unwrap();
        assert_eq!(decoded, event);
    }
}
