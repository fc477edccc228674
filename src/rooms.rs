//! Room Subscription Tracker.
//!
//! Holds the set of rooms the client intends to be in, per namespace,
//! regardless of connection state. Each subscription remembers which
//! authenticated session it was last joined on, so replay after a reconnect
//! emits exactly one join per room and never re-joins a room already joined
//! on the current session.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{ClientFrame, Namespace, RoomKey};
use crate::registry::NamespaceRegistry;

/// Identifies one UI context (a screen, a tab) that owns subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub namespace: Namespace,
    pub room: RoomKey,
    pub joined_at: DateTime<Utc>,
    /// Contexts holding this room. The room is left when the last one goes.
    pub owners: BTreeSet<ContextId>,
    /// Session on which a join frame was last sent.
    pub issued_session: Option<u64>,
}

pub struct RoomSubscriptionTracker {
    registry: Arc<NamespaceRegistry>,
    /// Insertion-ordered per namespace.
    intended: Mutex<HashMap<Namespace, Vec<Subscription>>>,
}

impl RoomSubscriptionTracker {
    pub fn new(registry: Arc<NamespaceRegistry>) -> Self {
        Self {
            registry,
            intended: Mutex::new(HashMap::new()),
        }
    }

    /// Add `room` to the intended set for `ctx`.
    ///
    /// Emits a join right away when the namespace is authenticated and the
    /// room was not already joined on this session. Returns `true` when the
    /// room is new to the intended set.
    pub fn join(&self, ctx: ContextId, namespace: Namespace, room: RoomKey) -> bool {
        let mut intended = self.intended.lock();
        let subs = intended.entry(namespace).or_default();

        let (index, added) = match subs.iter().position(|s| s.room == room) {
            Some(index) => {
                subs[index].owners.insert(ctx);
                (index, false)
            }
            None => {
                subs.push(Subscription {
                    namespace,
                    room,
                    joined_at: Utc::now(),
                    owners: BTreeSet::from([ctx]),
                    issued_session: None,
                });
                (subs.len() - 1, true)
            }
        };

        let sub = &mut subs[index];
        if let Some(conn) = self.registry.get(namespace)
            && conn.is_authenticated()
        {
            let session = conn.session();
            if sub.issued_session != Some(session) {
                match conn.send_control(&ClientFrame::JoinRoom {
                    room: sub.room.clone(),
                }) {
                    Ok(()) => {
                        sub.issued_session = Some(session);
                        tracing::info!(namespace = %namespace, room = %sub.room, "joined room");
                    }
                    Err(e) => {
                        tracing::debug!(namespace = %namespace, room = %sub.room, error = %e, "join deferred");
                    }
                }
            }
        } else {
            tracing::debug!(namespace = %namespace, room = %sub.room, "join deferred until authenticated");
        }
        added
    }

    /// Drop `ctx`'s hold on `room`. Returns `true` when the room left the
    /// intended set, in which case a leave is sent if connected.
    pub fn leave(&self, ctx: ContextId, namespace: Namespace, room: &RoomKey) -> bool {
        let mut intended = self.intended.lock();
        let Some(subs) = intended.get_mut(&namespace) else {
            return false;
        };
        let Some(index) = subs.iter().position(|s| &s.room == room) else {
            return false;
        };

        subs[index].owners.remove(&ctx);
        if !subs[index].owners.is_empty() {
            return false;
        }
        let removed = subs.remove(index);
        if subs.is_empty() {
            intended.remove(&namespace);
        }
        self.send_leave(namespace, &removed.room);
        true
    }

    /// Re-emit joins for every intended room on `namespace`, in insertion order.
    pub fn replay(&self, namespace: Namespace) -> Vec<RoomKey> {
        self.replay_with(namespace, |_| {})
    }

    /// Like [`replay`](Self::replay), calling `before_join` for each room
    /// just before its join frame goes out.
    pub fn replay_with(
        &self,
        namespace: Namespace,
        mut before_join: impl FnMut(&RoomKey),
    ) -> Vec<RoomKey> {
        let Some(conn) = self.registry.get(namespace) else {
            return Vec::new();
        };
        if !conn.is_authenticated() {
            return Vec::new();
        }
        let session = conn.session();

        let mut intended = self.intended.lock();
        let Some(subs) = intended.get_mut(&namespace) else {
            return Vec::new();
        };

        let mut joined = Vec::new();
        for sub in subs.iter_mut() {
            if sub.issued_session == Some(session) {
                continue;
            }
            before_join(&sub.room);
            match conn.send_control(&ClientFrame::JoinRoom {
                room: sub.room.clone(),
            }) {
                Ok(()) => {
                    sub.issued_session = Some(session);
                    joined.push(sub.room.clone());
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, room = %sub.room, error = %e, "replay interrupted");
                    break;
                }
            }
        }
        if !joined.is_empty() {
            tracing::info!(namespace = %namespace, session, rooms = joined.len(), "replayed room joins");
        }
        joined
    }

    /// Remove every hold `ctx` has. Returns the rooms that left the intended set.
    pub fn release_context(&self, ctx: ContextId) -> Vec<(Namespace, RoomKey)> {
        let mut released = Vec::new();
        let mut intended = self.intended.lock();
        for (namespace, subs) in intended.iter_mut() {
            subs.retain_mut(|sub| {
                sub.owners.remove(&ctx);
                if sub.owners.is_empty() {
                    released.push((*namespace, sub.room.clone()));
                    false
                } else {
                    true
                }
            });
        }
        intended.retain(|_, subs| !subs.is_empty());
        drop(intended);

        for (namespace, room) in &released {
            self.send_leave(*namespace, room);
        }
        released
    }

    pub fn subscriptions(&self, namespace: Namespace) -> Vec<Subscription> {
        self.intended
            .lock()
            .get(&namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rooms(&self, namespace: Namespace) -> Vec<RoomKey> {
        self.intended
            .lock()
            .get(&namespace)
            .map(|subs| subs.iter().map(|s| s.room.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_subscriptions(&self, namespace: Namespace) -> bool {
        self.intended
            .lock()
            .get(&namespace)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Namespaces on which `ctx` holds at least one room.
    pub fn namespaces_of(&self, ctx: ContextId) -> Vec<Namespace> {
        let mut names: Vec<_> = self
            .intended
            .lock()
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.owners.contains(&ctx)))
            .map(|(namespace, _)| *namespace)
            .collect();
        names.sort();
        names
    }

    fn send_leave(&self, namespace: Namespace, room: &RoomKey) {
        let sent = self.registry.with_namespace(namespace, |conn| {
            conn.is_authenticated()
                && conn
                    .send_control(&ClientFrame::LeaveRoom { room: room.clone() })
                    .is_ok()
        });
        if sent == Some(true) {
            tracing::info!(namespace = %namespace, room = %room, "left room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, MemoryPeer, MemoryTransport};
    use crate::reconnect::credentials::Credential;
    use crate::sync_config::SyncConfig;
    use tokio::sync::broadcast;

    fn setup() -> (MemoryTransport, Arc<NamespaceRegistry>, RoomSubscriptionTracker) {
        let transport = MemoryTransport::new();
        let (errors, _) = broadcast::channel(8);
        let registry = Arc::new(NamespaceRegistry::new(
            SyncConfig::default(),
            Arc::new(transport.clone()),
            errors,
        ));
        let tracker = RoomSubscriptionTracker::new(Arc::clone(&registry));
        (transport, registry, tracker)
    }

    async fn authenticate(transport: &MemoryTransport, conn: &ConnectionManager) -> MemoryPeer {
        let server = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut peer = transport.next_peer().await.unwrap();
                peer.accept("u1").await.unwrap();
                peer
            })
        };
        conn.connect(&Credential::new("t", "u1")).await.unwrap();
        server.await.unwrap()
    }

    const CTX: ContextId = ContextId(1);

    #[test]
    fn test_join_without_connection_is_deferred() {
        let (_transport, _registry, tracker) = setup();
        assert!(tracker.join(CTX, Namespace::Board, RoomKey::board("1")));
        assert!(!tracker.join(CTX, Namespace::Board, RoomKey::board("1")));

        let subs = tracker.subscriptions(Namespace::Board);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].issued_session, None);
        assert!(tracker.replay(Namespace::Board).is_empty());
    }

    #[tokio::test]
    async fn test_join_while_authenticated_emits_immediately() {
        let (transport, registry, tracker) = setup();
        let conn = registry.get_or_create(Namespace::Board).unwrap();
        let mut peer = authenticate(&transport, &conn).await;

        tracker.join(CTX, Namespace::Board, RoomKey::board("1"));
        tracker.join(ContextId(2), Namespace::Board, RoomKey::board("1"));

        assert_eq!(
            peer.recv().await,
            Some(ClientFrame::JoinRoom {
                room: RoomKey::board("1")
            })
        );
        assert!(peer.drain().is_empty());
        // Already joined on this session
        assert!(tracker.replay(Namespace::Board).is_empty());
    }

    #[tokio::test]
    async fn test_replay_after_reconnect_joins_each_room_once_in_order() {
        let (transport, registry, tracker) = setup();
        let conn = registry.get_or_create(Namespace::Board).unwrap();
        let first_peer = authenticate(&transport, &conn).await;
        tracker.join(CTX, Namespace::Board, RoomKey::board("1"));
        tracker.join(CTX, Namespace::Board, RoomKey::board("2"));

        conn.disconnect();
        drop(first_peer);
        let mut peer = authenticate(&transport, &conn).await;

        let mut hooked = Vec::new();
        let replayed = tracker.replay_with(Namespace::Board, |room| hooked.push(room.clone()));
        assert_eq!(replayed, vec![RoomKey::board("1"), RoomKey::board("2")]);
        assert_eq!(hooked, replayed);

        let mut frames = Vec::new();
        for _ in 0..2 {
            frames.push(peer.recv().await.unwrap());
        }
        assert_eq!(MemoryPeer::joined_rooms(&frames), replayed);

        assert!(tracker.replay(Namespace::Board).is_empty());
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_leave_only_when_last_owner_goes() {
        let (transport, registry, tracker) = setup();
        let conn = registry.get_or_create(Namespace::Board).unwrap();
        let mut peer = authenticate(&transport, &conn).await;
        let other = ContextId(2);

        tracker.join(CTX, Namespace::Board, RoomKey::board("1"));
        tracker.join(other, Namespace::Board, RoomKey::board("1"));
        peer.recv().await.unwrap();

        assert!(!tracker.leave(CTX, Namespace::Board, &RoomKey::board("1")));
        assert!(tracker.has_subscriptions(Namespace::Board));
        assert!(tracker.leave(other, Namespace::Board, &RoomKey::board("1")));
        assert!(!tracker.has_subscriptions(Namespace::Board));
        assert_eq!(
            peer.recv().await,
            Some(ClientFrame::LeaveRoom {
                room: RoomKey::board("1")
            })
        );
    }

    #[test]
    fn test_release_context_keeps_rooms_held_elsewhere() {
        let (_transport, _registry, tracker) = setup();
        let other = ContextId(2);
        tracker.join(CTX, Namespace::Board, RoomKey::board("1"));
        tracker.join(CTX, Namespace::Workspace, RoomKey::workspace("w1"));
        tracker.join(other, Namespace::Board, RoomKey::board("1"));

        assert_eq!(
            tracker.namespaces_of(CTX),
            vec![Namespace::Board, Namespace::Workspace]
        );
        let released = tracker.release_context(CTX);
        assert_eq!(
            released,
            vec![(Namespace::Workspace, RoomKey::workspace("w1"))]
        );
        assert_eq!(tracker.rooms(Namespace::Board), vec![RoomKey::board("1")]);
        assert!(!tracker.has_subscriptions(Namespace::Workspace));
        assert!(tracker.namespaces_of(CTX).is_empty());
    }
}
