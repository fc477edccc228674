//! Shared domain types: entity kinds, namespaces, rooms, and the wire vocabulary.

pub mod events;
pub mod frames;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use events::{
    EntityRecord, EventName, InboundEvent, MutationEvent, MutationKind, MutationRejection,
    RoomSnapshot,
};
pub use frames::{ClientFrame, ServerFrame};

/// Server-assigned (or provisional, client-assigned) entity identifier.
pub type EntityId = String;

/// Identifier of a locally submitted optimistic mutation.
pub type LocalId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workspace,
    Space,
    Member,
    Board,
    Column,
    Task,
    Tag,
}

/// Which kind of room an entity is broadcast through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomDomain {
    Workspace,
    Board,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Space => "space",
            Self::Member => "member",
            Self::Board => "board",
            Self::Column => "column",
            Self::Task => "task",
            Self::Tag => "tag",
        }
    }

    /// The kind a child of this kind must hang under, if the parent must be
    /// present locally before the child can be applied.
    pub fn required_parent(&self) -> Option<EntityKind> {
        match self {
            Self::Column | Self::Tag => Some(Self::Board),
            Self::Task => Some(Self::Column),
            Self::Space | Self::Member => Some(Self::Workspace),
            Self::Workspace | Self::Board => None,
        }
    }

    /// Columns are ordered within their board, tasks within their column.
    pub fn is_positional(&self) -> bool {
        matches!(self, Self::Column | Self::Task)
    }

    pub fn domain(&self) -> RoomDomain {
        match self {
            Self::Workspace | Self::Space | Self::Member => RoomDomain::Workspace,
            Self::Board | Self::Column | Self::Task | Self::Tag => RoomDomain::Board,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(Self::Workspace),
            "space" => Ok(Self::Space),
            "member" => Ok(Self::Member),
            "board" => Ok(Self::Board),
            "column" => Ok(Self::Column),
            "task" => Ok(Self::Task),
            "tag" => Ok(Self::Tag),
            _ => Err(format!("Invalid entity kind: {}", s)),
        }
    }
}

/// A (kind, id) pair. Ids are only unique within a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Logical real-time channel. Each namespace gets its own physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Board,
    Workspace,
    Chat,
    Notifications,
    System,
    Ai,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Self::Board,
        Self::Workspace,
        Self::Chat,
        Self::Notifications,
        Self::System,
        Self::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Workspace => "workspace",
            Self::Chat => "chat",
            Self::Notifications => "notifications",
            Self::System => "system",
            Self::Ai => "ai",
        }
    }

    /// Auxiliary namespaces get a small retry budget instead of retrying for
    /// as long as the owning context stays active.
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Self::Ai | Self::System)
    }

    /// Namespaces whose events mutate the normalized entity store.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::Board | Self::Workspace)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "board" => Ok(Self::Board),
            "workspace" => Ok(Self::Workspace),
            "chat" => Ok(Self::Chat),
            "notifications" => Ok(Self::Notifications),
            "system" => Ok(Self::System),
            "ai" => Ok(Self::Ai),
            _ => Err(format!("Invalid namespace: {}", s)),
        }
    }
}

/// Server-side broadcast group key, `<domain>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey(String);

impl RoomKey {
    pub fn board(board_id: &str) -> Self {
        Self(format!("board:{}", board_id))
    }

    pub fn workspace(workspace_id: &str) -> Self {
        Self(format!("workspace:{}", workspace_id))
    }

    pub fn notifications(user_id: &str) -> Self {
        Self(format!("notifications:{}", user_id))
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.split_once(':') {
            Some((domain, id)) if !domain.is_empty() && !id.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(format!("Invalid room key '{}': expected <domain>:<id>", raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.split_once(':').map(|(d, _)| d).unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or_default()
    }

    /// The entity at the root of this room's scope, for rooms that carry entities.
    pub fn root(&self) -> Option<EntityRef> {
        match self.domain() {
            "board" => Some(EntityRef::new(EntityKind::Board, self.id())),
            "workspace" => Some(EntityRef::new(EntityKind::Workspace, self.id())),
            _ => None,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomKey> for String {
    fn from(room: RoomKey) -> Self {
        room.0
    }
}
