//! Event Dispatcher.
//!
//! One dispatcher per stateful namespace. A single task owns the
//! [`Reconciler`] and the [`NotificationDeduplicator`]; everything that
//! touches them (inbound events, local submissions, resync markers, timer
//! ticks) goes through its command queue, so applies never interleave no
//! matter which thread the transport delivers on.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::errors::SyncError;
use crate::model::{InboundEvent, LocalId, Namespace, RoomKey};
use crate::notify::{DedupKey, Notice, NotificationDeduplicator, NotificationRecord};
use crate::reconcile::{
    EntityStore, MutationStatus, OptimisticOp, PendingOptimisticMutation, ReconcileSettings,
    Reconciler,
};
use crate::sync_config::SyncConfig;

enum Command {
    Inbound(InboundEvent),
    Optimistic {
        local_id: LocalId,
        op: OptimisticOp,
        reply: oneshot::Sender<PendingOptimisticMutation>,
    },
    BeginResync(RoomKey),
    DropRooms(Vec<RoomKey>),
    Reject {
        local_id: LocalId,
        reason: String,
    },
    Expire,
    Status {
        local_id: LocalId,
        reply: oneshot::Sender<Option<MutationStatus>>,
    },
    Notification {
        key: DedupKey,
        reply: oneshot::Sender<Option<NotificationRecord>>,
    },
    Barrier(oneshot::Sender<()>),
}

pub struct EventDispatcher {
    namespace: Namespace,
    tx: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<Arc<EntityStore>>,
    task: JoinHandle<()>,
}

impl EventDispatcher {
    /// Start the dispatcher task. Data problems go to `errors`, user-facing
    /// notices to `notices`.
    pub fn spawn(
        namespace: Namespace,
        config: &SyncConfig,
        local_user: Option<String>,
        errors: broadcast::Sender<SyncError>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(Arc::new(EntityStore::new()));

        let worker = Worker {
            namespace,
            reconciler: Reconciler::new(ReconcileSettings::from_config(config), local_user),
            dedup: NotificationDeduplicator::new(config.dedup_window(), config.notify.max_records),
            errors,
            notices,
            view_tx,
            published: 0,
            deferred: Vec::new(),
        };
        let task = tokio::spawn(worker.run(rx, config.tick_interval()));

        Self {
            namespace,
            tx,
            view_rx,
            task,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Queue an inbound event. Safe to call from any thread.
    pub fn inbound(&self, event: InboundEvent) -> Result<(), SyncError> {
        self.send(Command::Inbound(event))
    }

    /// A handle that only queues inbound events, for connection handlers.
    pub fn inbound_sink(&self) -> InboundSink {
        InboundSink {
            namespace: self.namespace,
            tx: self.tx.clone(),
        }
    }

    pub fn begin_resync(&self, room: RoomKey) -> Result<(), SyncError> {
        self.send(Command::BeginResync(room))
    }

    /// Forget state and pending changes for rooms no context holds any more.
    pub fn drop_rooms(&self, rooms: Vec<RoomKey>) -> Result<(), SyncError> {
        if rooms.is_empty() {
            return Ok(());
        }
        self.send(Command::DropRooms(rooms))
    }

    /// Roll back a pending change that never reached the server.
    pub fn reject(&self, local_id: LocalId, reason: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Reject {
            local_id,
            reason: reason.into(),
        })
    }

    /// Roll back optimistic changes older than the confirmation window now,
    /// without waiting for the next tick.
    pub fn expire(&self) -> Result<(), SyncError> {
        self.send(Command::Expire)
    }

    /// Apply a local change to the view. Resolves once the view carrying it
    /// has been published.
    pub async fn submit(
        &self,
        local_id: LocalId,
        op: OptimisticOp,
    ) -> Result<PendingOptimisticMutation, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Optimistic {
            local_id,
            op,
            reply,
        })?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn status(&self, local_id: &str) -> Result<Option<MutationStatus>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status {
            local_id: local_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn notification(&self, key: DedupKey) -> Result<Option<NotificationRecord>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Notification { key, reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Wait until everything queued so far has been applied and published.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Barrier(reply))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<EntityStore> {
        Arc::clone(&self.view_rx.borrow())
    }

    pub fn subscribe_view(&self) -> watch::Receiver<Arc<EntityStore>> {
        self.view_rx.clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.tx.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> SyncError {
        SyncError::DispatcherClosed {
            namespace: self.namespace,
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cloneable sender half used by connection event handlers.
#[derive(Clone)]
pub struct InboundSink {
    namespace: Namespace,
    tx: mpsc::UnboundedSender<Command>,
}

impl InboundSink {
    pub fn send(&self, event: InboundEvent) {
        if self.tx.send(Command::Inbound(event)).is_err() {
            tracing::debug!(namespace = %self.namespace, "dispatcher gone, dropping event");
        }
    }
}

enum Deferred {
    Submitted(oneshot::Sender<PendingOptimisticMutation>, PendingOptimisticMutation),
    Barrier(oneshot::Sender<()>),
}

struct Worker {
    namespace: Namespace,
    reconciler: Reconciler,
    dedup: NotificationDeduplicator,
    errors: broadcast::Sender<SyncError>,
    notices: broadcast::Sender<Notice>,
    view_tx: watch::Sender<Arc<EntityStore>>,
    published: u64,
    /// Replies held back until the view they depend on is published.
    deferred: Vec<Deferred>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, tick: std::time::Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle(command);
                    // Drain whatever else is queued before publishing once
                    while let Ok(command) = rx.try_recv() {
                        self.handle(command);
                    }
                }

                _ = ticker.tick() => {
                    self.reconciler.tick(Instant::now());
                    self.report();
                }
            }
            self.publish();
        }

        tracing::debug!(namespace = %self.namespace, "dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Inbound(InboundEvent::Mutation(event)) => {
                let outcome = self.reconciler.apply(event, now);
                tracing::trace!(namespace = %self.namespace, ?outcome, "mutation handled");
            }
            Command::Inbound(InboundEvent::Snapshot(snapshot)) => {
                self.reconciler.apply_snapshot(snapshot, now);
            }
            Command::Inbound(InboundEvent::Rejection(rejection)) => {
                if !self.reconciler.reject(&rejection.client_ref, &rejection.reason) {
                    tracing::debug!(
                        namespace = %self.namespace,
                        local_id = %rejection.client_ref,
                        "rejection for unknown or resolved change"
                    );
                }
            }
            Command::Inbound(InboundEvent::Other { name, .. }) => {
                tracing::debug!(namespace = %self.namespace, event = %name, "no reconciler handling");
            }
            Command::Optimistic {
                local_id,
                op,
                reply,
            } => {
                let mutation = self.reconciler.apply_optimistic(local_id, op, now);
                self.deferred.push(Deferred::Submitted(reply, mutation));
            }
            Command::BeginResync(room) => self.reconciler.begin_resync(room),
            Command::DropRooms(rooms) => {
                self.reconciler.discard_rooms(&rooms);
            }
            Command::Reject { local_id, reason } => {
                self.reconciler.reject(&local_id, &reason);
            }
            Command::Expire => {
                self.reconciler.expire(now);
            }
            Command::Status { local_id, reply } => {
                let _ = reply.send(self.reconciler.status(&local_id));
            }
            Command::Notification { key, reply } => {
                let _ = reply.send(self.dedup.record(&key).cloned());
            }
            Command::Barrier(reply) => self.deferred.push(Deferred::Barrier(reply)),
        }
        self.report();
    }

    /// Turn accepted remote changes and recorded issues into notices.
    fn report(&mut self) {
        let now = Instant::now();
        let local_user = self.reconciler.local_user().map(str::to_string);

        for accepted in self.reconciler.drain_accepted() {
            if !accepted.is_remote(local_user.as_deref()) {
                continue;
            }
            if self.dedup.notify(&accepted.event, now) {
                let _ = self.notices.send(Notice::change(self.namespace, &accepted.event));
            }
        }

        for issue in self.reconciler.drain_issues() {
            if self.dedup.admit(DedupKey::for_error(&issue), now) {
                let _ = self.notices.send(Notice::problem(self.namespace, &issue));
            }
            let _ = self.errors.send(issue);
        }
    }

    fn publish(&mut self) {
        let revision = self.reconciler.revision();
        if revision != self.published {
            self.view_tx
                .send_replace(Arc::new(self.reconciler.view().clone()));
            self.published = revision;
        }
        for deferred in self.deferred.drain(..) {
            match deferred {
                Deferred::Submitted(reply, mutation) => {
                    let _ = reply.send(mutation);
                }
                Deferred::Barrier(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    }
}
