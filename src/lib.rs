pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod reconnect;
pub mod registry;
pub mod rooms;
pub mod sync_config;

pub use connection::{ConnectionManager, ConnectionState, MemoryTransport, Transport, WebSocketTransport};
pub use engine::{NamespaceEvent, SyncEngine};
pub use errors::{Severity, SyncError};
pub use model::{EntityKind, EntityRef, InboundEvent, MutationEvent, Namespace, RoomKey};
pub use notify::Notice;
pub use reconcile::{EntityStore, MutationStatus, OptimisticOp};
pub use reconnect::{ControllerState, ControllerStatus, Credential, CredentialSource};
pub use rooms::ContextId;
pub use sync_config::SyncConfig;
