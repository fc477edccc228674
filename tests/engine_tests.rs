//! Engine tests over the in-memory transport.
//!
//! Each test plays the server side through a `MemoryPeer`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use boardsync::connection::{ConnectionState, MemoryPeer, MemoryTransport};
use boardsync::errors::Resource;
use boardsync::model::{ClientFrame, EntityKind, EntityRef, EventName, Namespace, RoomKey};
use boardsync::notify::{DedupKey, Notice};
use boardsync::reconcile::{EntityStore, MutationStatus, OptimisticOp};
use boardsync::reconnect::{ControllerState, Credential, CredentialSource};
use boardsync::rooms::ContextId;
use boardsync::sync_config::SyncConfig;
use boardsync::{SyncEngine, SyncError};

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.reconnect.base_delay_ms = 5;
    config.reconnect.max_delay_ms = 20;
    config.reconcile.tick_interval_ms = 10;
    config
}

fn new_engine(config: SyncConfig, transport: &MemoryTransport) -> SyncEngine {
    SyncEngine::new(
        config,
        Arc::new(transport.clone()),
        CredentialSource::new(Some(Credential::new("tok", "u1"))),
        "u1",
    )
}

async fn wait_ready(engine: &SyncEngine, namespace: Namespace) {
    let mut status = engine.subscribe_status(namespace).unwrap();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == ControllerState::Ready))
        .await
        .expect("namespace never became ready")
        .unwrap();
}

async fn wait_view(engine: &SyncEngine, predicate: impl Fn(&EntityStore) -> bool) -> Arc<EntityStore> {
    let mut view = engine.subscribe_view(Namespace::Board).unwrap();
    let store = tokio::time::timeout(WAIT, view.wait_for(|store| predicate(store)))
        .await
        .expect("view never reached expected state")
        .unwrap();
    Arc::clone(&store)
}

/// Accept the connection and consume the join frames for `rooms`.
async fn accept_with_joins(peer: &mut MemoryPeer, rooms: usize) -> Vec<ClientFrame> {
    peer.accept("u1").await.unwrap();
    let mut joins = Vec::new();
    for _ in 0..rooms {
        joins.push(peer.recv().await.unwrap());
    }
    joins
}

fn task(id: &str) -> EntityRef {
    EntityRef::new(EntityKind::Task, id)
}

fn column(id: &str) -> EntityRef {
    EntityRef::new(EntityKind::Column, id)
}

/// Board `1` with columns `c1`, `c2` and tasks `a`..`d` in `c1`.
fn seed_snapshot(peer: &MemoryPeer) {
    let mut entities = vec![
        json!({"kind": "board", "id": "1", "serverSeq": 1, "data": {"name": "Roadmap"}}),
        json!({"kind": "column", "id": "c1", "parentId": "1", "position": 0, "serverSeq": 1, "data": {"name": "Todo"}}),
        json!({"kind": "column", "id": "c2", "parentId": "1", "position": 1, "serverSeq": 1, "data": {"name": "Done"}}),
    ];
    for (position, id) in ["a", "b", "c", "d"].iter().enumerate() {
        entities.push(json!({
            "kind": "task", "id": id, "parentId": "c1", "position": position,
            "serverSeq": 1, "data": {"title": id}
        }));
    }
    assert!(peer.send_event("board:state", json!({"room": "board:1", "entities": entities})));
}

struct Harness {
    transport: MemoryTransport,
    engine: SyncEngine,
    peer: MemoryPeer,
    ctx: ContextId,
}

async fn seeded_board(config: SyncConfig) -> Harness {
    let transport = MemoryTransport::new();
    let engine = new_engine(config, &transport);
    let ctx = engine.open_context();
    engine.join(ctx, Namespace::Board, RoomKey::board("1")).unwrap();

    let mut peer = transport.next_peer().await.unwrap();
    accept_with_joins(&mut peer, 1).await;
    wait_ready(&engine, Namespace::Board).await;
    seed_snapshot(&peer);
    wait_view(&engine, |v| v.contains(&task("d"))).await;

    Harness {
        transport,
        engine,
        peer,
        ctx,
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_reconnect_replays_each_room_exactly_once() {
    let transport = MemoryTransport::new();
    let engine = new_engine(test_config(), &transport);
    let ctx = engine.open_context();
    engine.join(ctx, Namespace::Board, RoomKey::board("1")).unwrap();
    engine.join(ctx, Namespace::Board, RoomKey::board("2")).unwrap();

    let mut first = transport.next_peer().await.unwrap();
    let joins = accept_with_joins(&mut first, 2).await;
    assert_eq!(
        MemoryPeer::joined_rooms(&joins),
        vec![RoomKey::board("1"), RoomKey::board("2")]
    );
    wait_ready(&engine, Namespace::Board).await;

    // Sever the link
    drop(first);

    let mut second = tokio::time::timeout(WAIT, transport.next_peer())
        .await
        .unwrap()
        .unwrap();
    let replayed = accept_with_joins(&mut second, 2).await;
    assert_eq!(
        MemoryPeer::joined_rooms(&replayed),
        vec![RoomKey::board("1"), RoomKey::board("2")]
    );
    wait_ready(&engine, Namespace::Board).await;

    // No duplicate joins trail behind
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(MemoryPeer::joined_rooms(&second.drain()).is_empty());
    assert_eq!(engine.rooms(Namespace::Board).len(), 2);
}

#[tokio::test]
async fn test_auth_rejection_fails_until_credential_refresh() {
    let transport = MemoryTransport::new();
    let credentials = CredentialSource::new(Some(Credential::new("old", "u1")));
    let engine = SyncEngine::new(
        test_config(),
        Arc::new(transport.clone()),
        credentials.clone(),
        "u1",
    );
    let mut errors = engine.subscribe_errors();
    let ctx = engine.open_context();
    engine.join(ctx, Namespace::Board, RoomKey::board("1")).unwrap();

    let mut peer = transport.next_peer().await.unwrap();
    assert_eq!(peer.reject("expired").await.as_deref(), Some("old"));

    let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(err, SyncError::AuthRejected { .. }));
    let mut status = engine.subscribe_status(Namespace::Board).unwrap();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == ControllerState::Failed))
        .await
        .unwrap()
        .unwrap();

    credentials.set(Credential::new("fresh", "u1"));
    let mut retry = tokio::time::timeout(WAIT, transport.next_peer())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retry.accept("u1").await.as_deref(), Some("fresh"));
    wait_ready(&engine, Namespace::Board).await;
}

// =============================================================================
// Optimistic changes
// =============================================================================

#[tokio::test]
async fn test_optimistic_create_confirmed_by_echo() {
    let mut h = seeded_board(test_config()).await;
    let mut notices = h.engine.subscribe_notices();

    let pending = h
        .engine
        .submit(OptimisticOp::Create {
            kind: EntityKind::Task,
            parent_id: Some("c1".into()),
            position: None,
            data: fields(json!({"title": "Write tests"})),
        })
        .await
        .unwrap();
    assert!(pending.local_id.starts_with("tmp-"));

    // Visible right away under the provisional id
    let view = h.engine.view(Namespace::Board).unwrap();
    let provisional = view.get(&task(&pending.local_id)).unwrap();
    assert!(provisional.optimistic);
    assert_eq!(view.ordered_ids(EntityKind::Task, "c1")[4], pending.local_id);

    let ClientFrame::Event { event, payload } = h.peer.recv().await.unwrap() else {
        panic!("expected an intent event");
    };
    assert_eq!(event, "task:create");
    assert_eq!(payload["clientRef"], json!(pending.local_id));
    assert_eq!(payload["parentId"], "c1");

    h.peer.send_event(
        "task:created",
        json!({
            "entityId": "t1", "parentId": "c1", "position": 4, "serverSeq": 1,
            "clientRef": pending.local_id, "actor": "u1",
            "data": {"title": "Write tests", "priority": "high"}
        }),
    );
    let view = wait_view(&h.engine, |v| v.contains(&task("t1"))).await;

    assert!(!view.contains(&task(&pending.local_id)));
    let confirmed = view.get(&task("t1")).unwrap();
    assert!(!confirmed.optimistic);
    assert_eq!(confirmed.data["priority"], "high");
    assert_eq!(view.ordered_ids(EntityKind::Task, "c1"), vec!["a", "b", "c", "d", "t1"]);
    assert_eq!(
        h.engine
            .mutation_status(Namespace::Board, &pending.local_id)
            .await
            .unwrap(),
        Some(MutationStatus::Confirmed)
    );

    // Own changes are not announced
    h.engine.flush(Namespace::Board).await.unwrap();
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_server_rejection_rolls_back() {
    let mut h = seeded_board(test_config()).await;
    let mut errors = h.engine.subscribe_errors();

    let pending = h
        .engine
        .submit(OptimisticOp::Update {
            entity: task("a"),
            fields: fields(json!({"title": "renamed"})),
        })
        .await
        .unwrap();
    assert_eq!(
        h.engine.view(Namespace::Board).unwrap().get(&task("a")).unwrap().data["title"],
        "renamed"
    );
    h.peer.recv().await.unwrap();

    h.peer.send_event(
        "mutation:rejected",
        json!({"clientRef": pending.local_id, "reason": "read-only board"}),
    );
    let view = wait_view(&h.engine, |v| {
        v.get(&task("a")).is_some_and(|t| t.data["title"] == "a")
    })
    .await;
    assert!(!view.get(&task("a")).unwrap().optimistic);

    let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(
        err,
        SyncError::MutationRejected {
            local_id: pending.local_id.clone(),
            reason: "read-only board".into(),
        }
    );
    assert_eq!(
        h.engine
            .mutation_status(Namespace::Board, &pending.local_id)
            .await
            .unwrap(),
        Some(MutationStatus::Rejected)
    );
}

#[tokio::test]
async fn test_unconfirmed_change_times_out_keeping_other_events() {
    let mut config = test_config();
    config.reconcile.optimistic_timeout_ms = 100;
    let h = seeded_board(config).await;
    let mut errors = h.engine.subscribe_errors();

    let pending = h
        .engine
        .submit(OptimisticOp::Move {
            entity: task("a"),
            parent_id: "c2".into(),
            position: 0,
        })
        .await
        .unwrap();

    // Someone else's change lands while ours is pending
    h.peer.send_event(
        "task:updated",
        json!({"entityId": "b", "parentId": "c1", "position": 1, "serverSeq": 2,
               "actor": "u2", "data": {"title": "b2"}}),
    );

    let view = wait_view(&h.engine, |v| {
        v.get(&task("a"))
            .is_some_and(|t| t.parent_id.as_deref() == Some("c1") && !t.optimistic)
            && v.get(&task("b")).is_some_and(|t| t.data["title"] == "b2")
    })
    .await;
    assert_eq!(view.get(&task("b")).unwrap().data["title"], "b2");
    assert_eq!(view.ordered_ids(EntityKind::Task, "c1"), vec!["a", "b", "c", "d"]);
    assert!(view.ordered_ids(EntityKind::Task, "c2").is_empty());

    let err = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SyncError::OptimisticTimeout { local_id, .. }) = errors.recv().await {
                return local_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(err, pending.local_id);
}

#[tokio::test]
async fn test_full_emit_buffer_rolls_back_submit() {
    let mut config = test_config();
    config.connection.emit_buffer = 1;
    let Harness {
        transport,
        engine,
        peer,
        ..
    } = seeded_board(config).await;
    let mut errors = engine.subscribe_errors();

    // Lose the link and leave the reconnect attempt unanswered so emits queue
    drop(peer);
    let _unanswered = tokio::time::timeout(WAIT, transport.next_peer())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(
        engine.connection_state(Namespace::Board),
        Some(ConnectionState::Authenticated)
    );

    let queued = engine
        .submit(OptimisticOp::Update {
            entity: task("a"),
            fields: fields(json!({"title": "queued"})),
        })
        .await
        .unwrap();
    let before = engine.view(Namespace::Board).unwrap();

    let err = engine
        .submit(OptimisticOp::Move {
            entity: task("b"),
            parent_id: "c2".into(),
            position: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::CapacityExceeded {
            resource: Resource::EmitBuffer,
            limit: 1
        }
    ));

    let rejected = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SyncError::MutationRejected { local_id, .. }) = errors.recv().await {
                return local_id;
            }
        }
    })
    .await
    .unwrap();
    engine.flush(Namespace::Board).await.unwrap();

    let after = engine.view(Namespace::Board).unwrap();
    assert_eq!(*after, *before);
    assert_eq!(after.get(&task("b")).unwrap().parent_id.as_deref(), Some("c1"));
    assert_eq!(
        engine
            .mutation_status(Namespace::Board, &rejected)
            .await
            .unwrap(),
        Some(MutationStatus::Rejected)
    );
    assert_eq!(
        engine
            .mutation_status(Namespace::Board, &queued.local_id)
            .await
            .unwrap(),
        Some(MutationStatus::Pending)
    );
}

#[tokio::test]
async fn test_stale_changes_are_dropped_when_ready_again() {
    let mut config = test_config();
    config.reconcile.optimistic_timeout_ms = 200;
    // Only the return to Ready may expire anything here
    config.reconcile.tick_interval_ms = 60_000;
    let Harness {
        transport,
        engine,
        peer,
        ..
    } = seeded_board(config).await;
    let mut errors = engine.subscribe_errors();

    let stale = engine
        .submit(OptimisticOp::Move {
            entity: task("a"),
            parent_id: "c2".into(),
            position: 0,
        })
        .await
        .unwrap();
    drop(peer);

    let mut second = tokio::time::timeout(WAIT, transport.next_peer())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fresh = engine
        .submit(OptimisticOp::Update {
            entity: task("c"),
            fields: fields(json!({"title": "fresh"})),
        })
        .await
        .unwrap();
    let view = engine.view(Namespace::Board).unwrap();
    assert_eq!(view.get(&task("a")).unwrap().parent_id.as_deref(), Some("c2"));

    second.accept("u1").await.unwrap();
    wait_ready(&engine, Namespace::Board).await;
    engine.flush(Namespace::Board).await.unwrap();

    let view = engine.view(Namespace::Board).unwrap();
    let a = view.get(&task("a")).unwrap();
    assert_eq!(a.parent_id.as_deref(), Some("c1"));
    assert!(!a.optimistic);
    assert_eq!(view.get(&task("c")).unwrap().data["title"], "fresh");

    assert_eq!(
        engine
            .mutation_status(Namespace::Board, &stale.local_id)
            .await
            .unwrap(),
        Some(MutationStatus::Rejected)
    );
    assert_eq!(
        engine
            .mutation_status(Namespace::Board, &fresh.local_id)
            .await
            .unwrap(),
        Some(MutationStatus::Pending)
    );

    let expired = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SyncError::OptimisticTimeout { local_id, .. }) = errors.recv().await {
                return local_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(expired, stale.local_id);
}

// =============================================================================
// Live events
// =============================================================================

#[tokio::test]
async fn test_moves_keep_positions_contiguous() {
    let h = seeded_board(test_config()).await;

    let moves = [
        ("a", "c2", 0, 2),
        ("c", "c2", 5, 2),
        ("b", "c2", 1, 2),
        ("a", "c1", 0, 3),
        ("d", "c2", 0, 2),
        ("c", "c1", 9, 3),
    ];
    for (id, target, position, seq) in moves {
        h.peer.send_event(
            "task:moved",
            json!({"entityId": id, "parentId": target, "position": position,
                   "serverSeq": seq, "actor": "u2", "data": {"title": id}}),
        );
    }

    let view = wait_view(&h.engine, |v| {
        v.get(&task("c"))
            .and_then(|t| v.seq(&boardsync::reconcile::SeqKey::Entity(t.entity_ref())))
            == Some(3)
    })
    .await;

    for container in ["c1", "c2"] {
        let positions: Vec<_> = view
            .children(EntityKind::Task, container)
            .iter()
            .map(|t| t.position)
            .collect();
        let expected: Vec<_> = (0..positions.len() as u32).map(Some).collect();
        assert_eq!(positions, expected, "positions in {}", container);
    }
    assert_eq!(view.ordered_ids(EntityKind::Task, "c1"), vec!["a", "c"]);
    assert_eq!(view.ordered_ids(EntityKind::Task, "c2"), vec!["d", "b"]);
}

#[tokio::test]
async fn test_duplicate_delivery_is_ignored() {
    let h = seeded_board(test_config()).await;
    let update = json!({"entityId": "b", "parentId": "c1", "position": 1, "serverSeq": 2,
                        "actor": "u2", "data": {"title": "once"}});

    h.peer.send_event("task:updated", update.clone());
    let once = wait_view(&h.engine, |v| {
        v.get(&task("b")).is_some_and(|t| t.data["title"] == "once")
    })
    .await;

    h.peer.send_event("task:updated", update);
    // A later event marks the point the duplicate has been processed
    h.peer.send_event(
        "column:updated",
        json!({"entityId": "c2", "parentId": "1", "position": 1, "serverSeq": 2,
               "actor": "u2", "data": {"name": "Shipped"}}),
    );
    let twice = wait_view(&h.engine, |v| {
        v.get(&column("c2")).is_some_and(|c| c.data["name"] == "Shipped")
    })
    .await;

    assert_eq!(once.get(&task("b")), twice.get(&task("b")));
    assert_eq!(
        once.ordered_ids(EntityKind::Task, "c1"),
        twice.ordered_ids(EntityKind::Task, "c1")
    );
}

#[tokio::test]
async fn test_remote_burst_yields_one_notice() {
    let h = seeded_board(test_config()).await;
    let mut notices = h.engine.subscribe_notices();

    for seq in 1..=20u64 {
        h.peer.send_event(
            "task:created",
            json!({"entityId": "t9", "parentId": "c2", "position": 0, "serverSeq": seq,
                   "actor": "u2", "data": {"n": seq}}),
        );
    }
    wait_view(&h.engine, |v| {
        v.get(&task("t9")).is_some_and(|t| t.data["n"] == 20)
    })
    .await;
    h.engine.flush(Namespace::Board).await.unwrap();

    let mut shown = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        shown.push(notice);
    }
    assert_eq!(shown.len(), 1);
    assert!(matches!(
        &shown[0],
        Notice::Change { entity_id, actor, .. } if entity_id == "t9" && actor.as_deref() == Some("u2")
    ));

    let record = h
        .engine
        .notification_record(
            Namespace::Board,
            DedupKey::Change {
                entity_kind: EntityKind::Task,
                entity_id: "t9".into(),
                event: EventName::TaskCreated,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.suppressed_count, 19);
}

#[tokio::test]
async fn test_children_before_parent_are_applied_once_parent_lands() {
    let h = seeded_board(test_config()).await;

    h.peer.send_event(
        "task:created",
        json!({"entityId": "t5", "parentId": "c9", "position": 0, "serverSeq": 1, "actor": "u2"}),
    );
    h.peer.send_event(
        "column:created",
        json!({"entityId": "c9", "parentId": "1", "position": 2, "serverSeq": 1, "actor": "u2"}),
    );

    let view = wait_view(&h.engine, |v| v.contains(&task("t5"))).await;
    assert_eq!(view.ordered_ids(EntityKind::Task, "c9"), vec!["t5"]);
    assert_eq!(view.ordered_ids(EntityKind::Column, "1"), vec!["c1", "c2", "c9"]);
}

// =============================================================================
// Contexts and namespaces
// =============================================================================

#[tokio::test]
async fn test_close_context_disconnects_namespace() {
    let h = seeded_board(test_config()).await;
    let other = h.engine.open_context();
    h.engine
        .join(other, Namespace::Chat, RoomKey::parse("chat:general").unwrap())
        .unwrap();

    h.engine.close_context(h.ctx);

    assert!(h.engine.status(Namespace::Board).is_none());
    assert!(h.engine.registry().get(Namespace::Board).is_none());
    assert!(h.engine.status(Namespace::Chat).is_some());
    assert_eq!(h.transport.open_count(Namespace::Board), 1);
}

#[tokio::test]
async fn test_auxiliary_events_pass_through() {
    let transport = MemoryTransport::new();
    let engine = new_engine(test_config(), &transport);
    let mut events = engine.subscribe_events();
    let ctx = engine.open_context();
    engine
        .join(ctx, Namespace::Chat, RoomKey::parse("chat:general").unwrap())
        .unwrap();

    let mut peer = transport.next_peer().await.unwrap();
    assert_eq!(peer.namespace, Namespace::Chat);
    accept_with_joins(&mut peer, 1).await;
    wait_ready(&engine, Namespace::Chat).await;
    assert!(engine.view(Namespace::Chat).is_none());

    peer.send_event("chat:message", json!({"text": "hello"}));
    let received = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(received.namespace, Namespace::Chat);
    assert_eq!(received.event.name(), EventName::Other("chat:message".into()));
}
