//! `SyncEngine`: the registry, tracker, dispatchers and controllers wired
//! together for a host application.
//!
//! Everything is owned by the engine instance and handed to components
//! explicitly; nothing lives in process-wide state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::connection::{ConnectionManager, ConnectionState, Transport};
use crate::dispatch::EventDispatcher;
use crate::errors::SyncError;
use crate::model::{EntityKind, InboundEvent, LocalId, Namespace, RoomDomain, RoomKey};
use crate::notify::{DedupKey, Notice, NotificationRecord};
use crate::reconcile::{EntityStore, MutationStatus, OptimisticOp, PendingOptimisticMutation};
use crate::reconnect::{
    ControllerDeps, ControllerStatus, CredentialSource, ReconnectController, ReconnectMachine,
};
use crate::registry::NamespaceRegistry;
use crate::rooms::{ContextId, RoomSubscriptionTracker};
use crate::sync_config::SyncConfig;

const ERROR_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-namespace runtime pieces, created on first join.
struct NamespaceRuntime {
    connection: Arc<ConnectionManager>,
    dispatcher: Option<Arc<EventDispatcher>>,
    controller: ReconnectController,
}

/// An event from a namespace with no reconciled state (chat, ai, ...).
#[derive(Debug, Clone)]
pub struct NamespaceEvent {
    pub namespace: Namespace,
    pub event: InboundEvent,
}

pub struct SyncEngine {
    config: SyncConfig,
    local_user: String,
    credentials: CredentialSource,
    registry: Arc<NamespaceRegistry>,
    tracker: Arc<RoomSubscriptionTracker>,
    errors: broadcast::Sender<SyncError>,
    notices: broadcast::Sender<Notice>,
    events: broadcast::Sender<NamespaceEvent>,
    next_context: AtomicU64,
    runtimes: Mutex<HashMap<Namespace, NamespaceRuntime>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        credentials: CredentialSource,
        user_id: impl Into<String>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(NamespaceRegistry::new(
            config.clone(),
            transport,
            errors.clone(),
        ));
        let tracker = Arc::new(RoomSubscriptionTracker::new(Arc::clone(&registry)));

        Self {
            config,
            local_user: user_id.into(),
            credentials,
            registry,
            tracker,
            errors,
            notices,
            events,
            next_context: AtomicU64::new(1),
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn credentials(&self) -> &CredentialSource {
        &self.credentials
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// A new owner for room subscriptions (a screen, a view, a session).
    pub fn open_context(&self) -> ContextId {
        ContextId::new(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    /// Hold `room` on `namespace` for `ctx`, connecting the namespace if
    /// needed. Must be called from within a Tokio runtime.
    pub fn join(&self, ctx: ContextId, namespace: Namespace, room: RoomKey) -> Result<(), SyncError> {
        let (dispatcher, started) = {
            let mut runtimes = self.runtimes.lock();
            let created = !runtimes.contains_key(&namespace);
            if created {
                let runtime = self.build_runtime(namespace)?;
                runtimes.insert(namespace, runtime);
            }
            let runtime = runtimes
                .get(&namespace)
                .ok_or(SyncError::DispatcherClosed { namespace })?;
            (runtime.dispatcher.clone(), created)
        };

        let already_intended = self.tracker.rooms(namespace).contains(&room);
        if !already_intended && let Some(dispatcher) = &dispatcher {
            // Mark before the join goes out so the snapshot prunes correctly
            dispatcher.begin_resync(room.clone())?;
        }
        self.tracker.join(ctx, namespace, room);

        if let Some(runtime) = self.runtimes.lock().get(&namespace) {
            runtime.controller.start();
        }
        if started {
            tracing::info!(namespace = %namespace, "namespace started");
        }
        Ok(())
    }

    /// Release `ctx`'s hold on `room`. Returns `true` if the room was left.
    pub fn leave(&self, ctx: ContextId, namespace: Namespace, room: &RoomKey) -> bool {
        let left = self.tracker.leave(ctx, namespace, room);
        if left {
            self.drop_rooms(namespace, vec![room.clone()]);
            if !self.tracker.has_subscriptions(namespace) {
                self.teardown(namespace);
            }
        }
        left
    }

    /// Release everything `ctx` holds; namespaces left without subscriptions
    /// are stopped and disconnected.
    pub fn close_context(&self, ctx: ContextId) {
        let mut released: BTreeMap<Namespace, Vec<RoomKey>> = BTreeMap::new();
        for (namespace, room) in self.tracker.release_context(ctx) {
            released.entry(namespace).or_default().push(room);
        }

        for (namespace, rooms) in released {
            self.drop_rooms(namespace, rooms);
            if !self.tracker.has_subscriptions(namespace) {
                self.teardown(namespace);
            }
        }
        tracing::debug!(context = %ctx, "context closed");
    }

    /// Apply a local change now and send it to the server.
    ///
    /// Resolves once the change is visible in [`view`](Self::view). The
    /// returned mutation's `local_id` tracks it until the server confirms or
    /// rejects it, or it times out.
    pub async fn submit(&self, op: OptimisticOp) -> Result<PendingOptimisticMutation, SyncError> {
        let namespace = namespace_for(&op);
        let (connection, dispatcher) = {
            let runtimes = self.runtimes.lock();
            let runtime = runtimes
                .get(&namespace)
                .ok_or(SyncError::DispatcherClosed { namespace })?;
            let dispatcher = runtime
                .dispatcher
                .clone()
                .ok_or(SyncError::DispatcherClosed { namespace })?;
            (Arc::clone(&runtime.connection), dispatcher)
        };

        let local_id: LocalId = format!("tmp-{}", Uuid::new_v4());
        let (event, payload) = intent_frame(&local_id, &op);
        let mutation = dispatcher.submit(local_id.clone(), op).await?;

        if let Err(e) = connection.emit(&event, payload) {
            tracing::warn!(namespace = %namespace, local_id = %local_id, error = %e, "change not sent");
            dispatcher.reject(local_id, e.to_string())?;
            return Err(e);
        }
        tracing::debug!(namespace = %namespace, local_id = %mutation.local_id, event, "change submitted");
        Ok(mutation)
    }

    /// Latest published view of a stateful namespace.
    pub fn view(&self, namespace: Namespace) -> Option<Arc<EntityStore>> {
        self.dispatcher(namespace).map(|d| d.view())
    }

    pub fn subscribe_view(&self, namespace: Namespace) -> Option<watch::Receiver<Arc<EntityStore>>> {
        self.dispatcher(namespace).map(|d| d.subscribe_view())
    }

    /// Wait until every event received so far on `namespace` is reflected in its view.
    pub async fn flush(&self, namespace: Namespace) -> Result<(), SyncError> {
        match self.dispatcher(namespace) {
            Some(dispatcher) => dispatcher.flush().await,
            None => Ok(()),
        }
    }

    pub async fn mutation_status(
        &self,
        namespace: Namespace,
        local_id: &str,
    ) -> Result<Option<MutationStatus>, SyncError> {
        match self.dispatcher(namespace) {
            Some(dispatcher) => dispatcher.status(local_id).await,
            None => Ok(None),
        }
    }

    pub async fn notification_record(
        &self,
        namespace: Namespace,
        key: DedupKey,
    ) -> Result<Option<NotificationRecord>, SyncError> {
        match self.dispatcher(namespace) {
            Some(dispatcher) => dispatcher.notification(key).await,
            None => Ok(None),
        }
    }

    pub fn status(&self, namespace: Namespace) -> Option<ControllerStatus> {
        self.runtimes
            .lock()
            .get(&namespace)
            .map(|r| r.controller.status())
    }

    pub fn subscribe_status(&self, namespace: Namespace) -> Option<watch::Receiver<ControllerStatus>> {
        self.runtimes
            .lock()
            .get(&namespace)
            .map(|r| r.controller.subscribe_status())
    }

    pub fn connection_state(&self, namespace: Namespace) -> Option<ConnectionState> {
        self.registry.get(namespace).map(|c| c.state())
    }

    /// Rooms currently intended on `namespace`.
    pub fn rooms(&self, namespace: Namespace) -> Vec<RoomKey> {
        self.tracker.rooms(namespace)
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<_> = self.runtimes.lock().keys().copied().collect();
        namespaces.sort();
        namespaces
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Events from namespaces without reconciled state.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NamespaceEvent> {
        self.events.subscribe()
    }

    /// Stop every namespace. Subscriptions are kept, so a later join
    /// reconnects with the full intended set.
    pub fn shutdown(&self) {
        let runtimes: Vec<_> = self.runtimes.lock().drain().collect();
        for (namespace, runtime) in runtimes {
            Self::stop_runtime(namespace, runtime);
            self.registry.release(namespace);
        }
        tracing::info!("sync engine shut down");
    }

    fn dispatcher(&self, namespace: Namespace) -> Option<Arc<EventDispatcher>> {
        self.runtimes
            .lock()
            .get(&namespace)
            .and_then(|r| r.dispatcher.clone())
    }

    fn build_runtime(&self, namespace: Namespace) -> Result<NamespaceRuntime, SyncError> {
        let connection = self.registry.get_or_create(namespace)?;

        let dispatcher = if namespace.is_stateful() {
            let dispatcher = Arc::new(EventDispatcher::spawn(
                namespace,
                &self.config,
                Some(self.local_user.clone()),
                self.errors.clone(),
                self.notices.clone(),
            ));
            let sink = dispatcher.inbound_sink();
            connection.on_any(move |event| sink.send(event.clone()));
            Some(dispatcher)
        } else {
            let events = self.events.clone();
            connection.on_any(move |event| {
                let _ = events.send(NamespaceEvent {
                    namespace,
                    event: event.clone(),
                });
            });
            None
        };

        let controller = ReconnectController::spawn(
            ReconnectMachine::new(namespace, &self.config),
            ControllerDeps {
                connection: Arc::clone(&connection),
                tracker: Arc::clone(&self.tracker),
                dispatcher: dispatcher.clone(),
                credentials: self.credentials.clone(),
                errors: self.errors.clone(),
            },
        );

        Ok(NamespaceRuntime {
            connection,
            dispatcher,
            controller,
        })
    }

    fn drop_rooms(&self, namespace: Namespace, rooms: Vec<RoomKey>) {
        if let Some(dispatcher) = self.dispatcher(namespace)
            && let Err(e) = dispatcher.drop_rooms(rooms)
        {
            tracing::debug!(namespace = %namespace, error = %e, "dropping rooms after dispatcher stop");
        }
    }

    fn teardown(&self, namespace: Namespace) {
        let Some(runtime) = self.runtimes.lock().remove(&namespace) else {
            return;
        };
        Self::stop_runtime(namespace, runtime);
        self.registry.release(namespace);
        tracing::info!(namespace = %namespace, "namespace stopped");
    }

    fn stop_runtime(namespace: Namespace, runtime: NamespaceRuntime) {
        runtime.controller.stop();
        runtime.connection.disconnect();
        if let Some(dispatcher) = &runtime.dispatcher {
            dispatcher.shutdown();
        }
        tracing::debug!(namespace = %namespace, "runtime stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for (_, runtime) in self.runtimes.lock().drain() {
            runtime.connection.disconnect();
        }
    }
}

/// The stateful namespace a change is broadcast through.
fn namespace_for(op: &OptimisticOp) -> Namespace {
    let kind = match op {
        OptimisticOp::Create { kind, .. } => *kind,
        OptimisticOp::Update { entity, .. }
        | OptimisticOp::Move { entity, .. }
        | OptimisticOp::Delete { entity } => entity.kind,
    };
    match kind.domain() {
        RoomDomain::Board => Namespace::Board,
        RoomDomain::Workspace => Namespace::Workspace,
    }
}

/// Outbound intent event (`task:create`, `column:move`, ...) and its payload.
fn intent_frame(local_id: &str, op: &OptimisticOp) -> (String, Value) {
    fn name(kind: EntityKind, verb: &str) -> String {
        format!("{}:{}", kind, verb)
    }

    let mut payload = Map::new();
    payload.insert("clientRef".into(), json!(local_id));
    let event = match op {
        OptimisticOp::Create {
            kind,
            parent_id,
            position,
            data,
        } => {
            if let Some(parent_id) = parent_id {
                payload.insert("parentId".into(), json!(parent_id));
            }
            if let Some(position) = position {
                payload.insert("position".into(), json!(position));
            }
            payload.insert("data".into(), Value::Object(data.clone()));
            name(*kind, "create")
        }
        OptimisticOp::Update { entity, fields } => {
            payload.insert("entityId".into(), json!(entity.id));
            payload.insert("data".into(), Value::Object(fields.clone()));
            name(entity.kind, "update")
        }
        OptimisticOp::Move {
            entity,
            parent_id,
            position,
        } => {
            payload.insert("entityId".into(), json!(entity.id));
            payload.insert("parentId".into(), json!(parent_id));
            payload.insert("position".into(), json!(position));
            name(entity.kind, "move")
        }
        OptimisticOp::Delete { entity } => {
            payload.insert("entityId".into(), json!(entity.id));
            name(entity.kind, "delete")
        }
    };
    (event, Value::Object(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryTransport;
    use crate::model::{ClientFrame, EntityRef};
    use crate::reconnect::{ControllerState, Credential};

    fn engine(transport: &MemoryTransport) -> SyncEngine {
        SyncEngine::new(
            SyncConfig::default(),
            Arc::new(transport.clone()),
            CredentialSource::new(Some(Credential::new("tok", "u1"))),
            "u1",
        )
    }

    #[test]
    fn test_intent_frame_shapes() {
        let (event, payload) = intent_frame(
            "tmp-1",
            &OptimisticOp::Move {
                entity: EntityRef::new(EntityKind::Task, "t1"),
                parent_id: "c2".into(),
                position: 0,
            },
        );
        assert_eq!(event, "task:move");
        assert_eq!(
            payload,
            json!({"clientRef": "tmp-1", "entityId": "t1", "parentId": "c2", "position": 0})
        );

        let (event, payload) = intent_frame(
            "tmp-2",
            &OptimisticOp::Create {
                kind: EntityKind::Column,
                parent_id: Some("b1".into()),
                position: None,
                data: Map::new(),
            },
        );
        assert_eq!(event, "column:create");
        assert_eq!(payload["parentId"], "b1");
        assert!(payload.get("position").is_none());
    }

    #[test]
    fn test_namespace_for_follows_entity_domain() {
        let delete_member = OptimisticOp::Delete {
            entity: EntityRef::new(EntityKind::Member, "m1"),
        };
        assert_eq!(namespace_for(&delete_member), Namespace::Workspace);
        let delete_tag = OptimisticOp::Delete {
            entity: EntityRef::new(EntityKind::Tag, "g1"),
        };
        assert_eq!(namespace_for(&delete_tag), Namespace::Board);
    }

    #[tokio::test]
    async fn test_join_connects_and_sends_join() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let ctx = engine.open_context();
        engine
            .join(ctx, Namespace::Board, RoomKey::board("1"))
            .unwrap();

        let mut peer = transport.next_peer().await.unwrap();
        assert_eq!(peer.accept("u1").await.as_deref(), Some("tok"));
        assert_eq!(
            peer.recv().await,
            Some(ClientFrame::JoinRoom {
                room: RoomKey::board("1")
            })
        );

        let mut status = engine.subscribe_status(Namespace::Board).unwrap();
        status
            .wait_for(|s| s.state == ControllerState::Ready)
            .await
            .unwrap();
        assert_eq!(engine.namespaces(), vec![Namespace::Board]);
    }

    #[tokio::test]
    async fn test_submit_without_namespace_fails() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let err = engine
            .submit(OptimisticOp::Delete {
                entity: EntityRef::new(EntityKind::Task, "t1"),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::DispatcherClosed {
                namespace: Namespace::Board
            }
        );
    }

    #[tokio::test]
    async fn test_close_context_stops_only_its_namespaces() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let board_ctx = engine.open_context();
        let chat_ctx = engine.open_context();
        engine
            .join(board_ctx, Namespace::Board, RoomKey::board("1"))
            .unwrap();
        engine
            .join(chat_ctx, Namespace::Chat, RoomKey::parse("chat:general").unwrap())
            .unwrap();
        assert_eq!(engine.namespaces(), vec![Namespace::Board, Namespace::Chat]);

        engine.close_context(board_ctx);
        assert_eq!(engine.namespaces(), vec![Namespace::Chat]);
        assert!(engine.view(Namespace::Board).is_none());
        assert!(engine.registry().get(Namespace::Board).is_none());
        assert!(engine.registry().get(Namespace::Chat).is_some());
    }

    #[tokio::test]
    async fn test_leave_last_room_tears_down_namespace() {
        let transport = MemoryTransport::new();
        let engine = engine(&transport);
        let ctx = engine.open_context();
        let room = RoomKey::board("1");
        engine.join(ctx, Namespace::Board, room.clone()).unwrap();
        engine
            .join(ctx, Namespace::Board, RoomKey::board("2"))
            .unwrap();

        assert!(engine.leave(ctx, Namespace::Board, &room));
        assert_eq!(engine.namespaces(), vec![Namespace::Board]);
        assert!(engine.leave(ctx, Namespace::Board, &RoomKey::board("2")));
        assert!(engine.namespaces().is_empty());
        assert!(!engine.leave(ctx, Namespace::Board, &room));
    }
}
