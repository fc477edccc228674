//! Connection Manager: the lifecycle of one physical channel for one namespace.
//!
//! ```text
//! disconnected ──connect()──> connecting ──open ok──> connected ──auth_ok──> authenticated
//!       ^                          │                      │                      │
//!       │                          └──────────┬───────────┘                      │ link lost
//!       └──────── disconnect() ───────────── error <─────────────────────────────┘
//! ```
//!
//! Every transition is published as a [`LifecycleEvent`]. Outbound events
//! emitted before the channel is authenticated are held in a bounded queue
//! and flushed in submission order on authentication.

pub mod memory;
pub mod transport;
pub mod websocket;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::errors::{FailureReason, Resource, SyncError};
use crate::model::{ClientFrame, EventName, InboundEvent, Namespace, ServerFrame};
use crate::reconnect::credentials::Credential;
use crate::sync_config::SyncConfig;

pub use memory::{MemoryPeer, MemoryTransport};
pub use transport::{Transport, TransportFailure, TransportLink};
pub use websocket::WebSocketTransport;

const LIFECYCLE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error,
}

impl ConnectionState {
    /// A connect attempt or live session is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Authenticated)
    }
}

/// Observable state transition of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub namespace: Namespace,
    pub state: ConnectionState,
    /// Set when `state` is `Error`.
    pub error: Option<SyncError>,
    /// Authenticated sessions so far, including this one.
    pub session: u64,
}

pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventFilter {
    Named(EventName),
    Any,
}

impl EventFilter {
    fn matches(&self, name: &EventName) -> bool {
        match self {
            Self::Named(n) => n == name,
            Self::Any => true,
        }
    }
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    last_error: Option<SyncError>,
    retry_count: u32,
    /// Bumped by every connect and disconnect; stale async work checks it.
    generation: u64,
    session: u64,
    user_id: Option<String>,
    link: Option<ActiveLink>,
    queue: VecDeque<String>,
}

/// Owns one physical channel. Never shared across namespaces.
pub struct ConnectionManager {
    namespace: Namespace,
    endpoint: String,
    connect_timeout: Duration,
    emit_capacity: usize,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<Inner>>,
    handlers: Arc<RwLock<Vec<(EventFilter, Handler)>>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    errors: broadcast::Sender<SyncError>,
}

impl ConnectionManager {
    /// `errors` receives events that arrive malformed; they are dropped here.
    pub fn new(
        namespace: Namespace,
        config: &SyncConfig,
        transport: Arc<dyn Transport>,
        errors: broadcast::Sender<SyncError>,
    ) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            namespace,
            endpoint: config.transport.endpoint.clone(),
            connect_timeout: config.connect_timeout(),
            emit_capacity: config.connection.emit_buffer,
            transport,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                last_error: None,
                retry_count: 0,
                generation: 0,
                session: 0,
                user_id: None,
                link: None,
                queue: VecDeque::new(),
            })),
            handlers: Arc::new(RwLock::new(Vec::new())),
            lifecycle_tx,
            errors,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.lock().last_error.clone()
    }

    /// Consecutive failed connects since the last authenticated session.
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Number of sessions that reached `authenticated`.
    pub fn session(&self) -> u64 {
        self.inner.lock().session
    }

    /// Identity acknowledged by the server for the current session.
    pub fn user_id(&self) -> Option<String> {
        self.inner.lock().user_id.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Open the channel and authenticate with `credential`.
    ///
    /// A no-op while a connect is in flight or a session is live. Failures
    /// leave the connection in `Error` with the reason recorded.
    pub async fn connect(&self, credential: &Credential) -> Result<(), SyncError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.state.is_active() {
                return Ok(());
            }
            inner.generation += 1;
            self.transition(&mut inner, ConnectionState::Connecting, None);
            inner.generation
        };
        tracing::info!(namespace = %self.namespace, "connecting");

        let opened = tokio::time::timeout(
            self.connect_timeout,
            self.transport.open(&self.endpoint, self.namespace),
        )
        .await;
        let mut link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(failure)) => {
                return Err(self.fail(generation, failure.reason, failure.message));
            }
            Err(_) => {
                return Err(self.fail(
                    generation,
                    FailureReason::Timeout,
                    "transport open timed out".to_string(),
                ));
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Err(self.cancelled());
            }
            self.transition(&mut inner, ConnectionState::Connected, None);
        }

        let auth = ClientFrame::Authenticate {
            token: credential.token.clone(),
        }
        .encode()?;
        if link.outbound.send(auth).is_err() {
            return Err(self.fail(
                generation,
                FailureReason::Network,
                "link closed before handshake".to_string(),
            ));
        }

        let reply = tokio::time::timeout(self.connect_timeout, await_auth(&mut link.inbound)).await;
        let user_id = match reply {
            Ok(Ok(user_id)) => user_id,
            Ok(Err(HandshakeError::Rejected(reason))) => {
                return Err(self.fail(generation, FailureReason::AuthRejected, reason));
            }
            Ok(Err(HandshakeError::Closed)) => {
                return Err(self.fail(
                    generation,
                    FailureReason::Network,
                    "link closed during handshake".to_string(),
                ));
            }
            Err(_) => {
                return Err(self.fail(
                    generation,
                    FailureReason::Timeout,
                    "no credential acknowledgement".to_string(),
                ));
            }
        };

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return Err(self.cancelled());
        }

        // Flush under the lock so direct emits cannot overtake queued ones
        let mut flushed = 0usize;
        while let Some(frame) = inner.queue.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = link.outbound.send(frame) {
                inner.queue.push_front(frame);
                break;
            }
            flushed += 1;
        }

        let reader = tokio::spawn(read_loop(ReadContext {
            namespace: self.namespace,
            inbound: link.inbound,
            generation,
            inner: Arc::clone(&self.inner),
            handlers: Arc::clone(&self.handlers),
            lifecycle_tx: self.lifecycle_tx.clone(),
            errors: self.errors.clone(),
        }));

        inner.link = Some(ActiveLink {
            outbound: link.outbound,
            reader,
        });
        inner.session += 1;
        inner.retry_count = 0;
        inner.last_error = None;
        inner.user_id = Some(user_id);
        self.transition(&mut inner, ConnectionState::Authenticated, None);
        tracing::info!(
            namespace = %self.namespace,
            session = inner.session,
            flushed,
            "authenticated"
        );
        Ok(())
    }

    /// Close the channel. Idempotent. Queued emits and room intent survive.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if let Some(link) = inner.link.take() {
            link.reader.abort();
        }
        if inner.state != ConnectionState::Disconnected {
            tracing::info!(namespace = %self.namespace, "disconnected");
            self.transition(&mut inner, ConnectionState::Disconnected, None);
        }
    }

    /// Fire-and-forget when authenticated, otherwise queue.
    ///
    /// Fails with `CapacityExceeded` once the queue is full; the event is dropped.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), SyncError> {
        let frame = ClientFrame::Event {
            event: event.to_string(),
            payload,
        }
        .encode()?;

        let mut inner = self.inner.lock();
        let frame = match (&inner.link, inner.state) {
            (Some(link), ConnectionState::Authenticated) => match link.outbound.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            _ => frame,
        };

        if inner.queue.len() >= self.emit_capacity {
            tracing::warn!(
                namespace = %self.namespace,
                event,
                limit = self.emit_capacity,
                "emit buffer full, dropping event"
            );
            return Err(SyncError::CapacityExceeded {
                resource: Resource::EmitBuffer,
                limit: self.emit_capacity,
            });
        }
        inner.queue.push_back(frame);
        Ok(())
    }

    /// Send a control frame (room join/leave). Requires an authenticated session;
    /// control frames are never queued.
    pub fn send_control(&self, frame: &ClientFrame) -> Result<(), SyncError> {
        let text = frame.encode()?;
        let inner = self.inner.lock();
        match (&inner.link, inner.state) {
            (Some(link), ConnectionState::Authenticated) => {
                link.outbound
                    .send(text)
                    .map_err(|_| SyncError::NotAuthenticated {
                        namespace: self.namespace,
                    })
            }
            _ => Err(SyncError::NotAuthenticated {
                namespace: self.namespace,
            }),
        }
    }

    /// Register a handler for one event name. Handlers run in registration order.
    pub fn on<F>(&self, event: EventName, handler: F)
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .push((EventFilter::Named(event), Arc::new(handler)));
    }

    /// Register a handler for every inbound event.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.handlers.write().push((EventFilter::Any, Arc::new(handler)));
    }

    /// Remove every handler registered for `event` with [`on`](Self::on).
    pub fn off(&self, event: &EventName) {
        self.handlers
            .write()
            .retain(|(filter, _)| !matches!(filter, EventFilter::Named(n) if n == event));
    }

    fn transition(&self, inner: &mut Inner, state: ConnectionState, error: Option<SyncError>) {
        inner.state = state;
        // No receivers is fine
        let _ = self.lifecycle_tx.send(LifecycleEvent {
            namespace: self.namespace,
            state,
            error,
            session: inner.session,
        });
    }

    fn fail(&self, generation: u64, reason: FailureReason, message: String) -> SyncError {
        let error = match reason {
            FailureReason::AuthRejected => SyncError::AuthRejected {
                namespace: self.namespace,
                reason: message,
            },
            _ => SyncError::Transport {
                namespace: self.namespace,
                reason,
                message,
            },
        };

        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.retry_count += 1;
            inner.last_error = Some(error.clone());
            tracing::warn!(
                namespace = %self.namespace,
                reason = %reason,
                retry_count = inner.retry_count,
                error = %error,
                "connect failed"
            );
            self.transition(&mut inner, ConnectionState::Error, Some(error.clone()));
        }
        error
    }

    fn cancelled(&self) -> SyncError {
        tracing::debug!(namespace = %self.namespace, "connect superseded by disconnect");
        SyncError::Transport {
            namespace: self.namespace,
            reason: FailureReason::Network,
            message: "connect cancelled".to_string(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(link) = self.inner.lock().link.take() {
            link.reader.abort();
        }
    }
}

enum HandshakeError {
    Rejected(String),
    Closed,
}

async fn await_auth(inbound: &mut mpsc::UnboundedReceiver<String>) -> Result<String, HandshakeError> {
    while let Some(text) = inbound.recv().await {
        match ServerFrame::decode(&text) {
            Ok(ServerFrame::AuthOk { user_id }) => return Ok(user_id),
            Ok(ServerFrame::AuthRejected { reason }) => return Err(HandshakeError::Rejected(reason)),
            Ok(ServerFrame::Event { event, .. }) => {
                tracing::debug!(event, "ignoring event before authentication");
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame during handshake");
            }
        }
    }
    Err(HandshakeError::Closed)
}

struct ReadContext {
    namespace: Namespace,
    inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
    inner: Arc<Mutex<Inner>>,
    handlers: Arc<RwLock<Vec<(EventFilter, Handler)>>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    errors: broadcast::Sender<SyncError>,
}

/// Decode inbound frames and fan them out to handlers until the link drops.
async fn read_loop(mut ctx: ReadContext) {
    while let Some(text) = ctx.inbound.recv().await {
        let frame = match ServerFrame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(namespace = %ctx.namespace, error = %e, "dropping undecodable frame");
                continue;
            }
        };
        let (name, payload) = match frame {
            ServerFrame::Event { event, payload } => (event, payload),
            ServerFrame::AuthOk { .. } | ServerFrame::AuthRejected { .. } => {
                tracing::debug!(namespace = %ctx.namespace, "ignoring late handshake frame");
                continue;
            }
        };

        let event = match InboundEvent::decode(&name, payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(namespace = %ctx.namespace, error = %e, "dropping malformed event");
                let _ = ctx.errors.send(e);
                continue;
            }
        };

        let event_name = event.name();
        let matching: Vec<Handler> = ctx
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| filter.matches(&event_name))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in matching {
            handler(&event);
        }
    }

    let mut inner = ctx.inner.lock();
    if inner.generation != ctx.generation {
        return;
    }
    inner.link = None;
    let error = SyncError::Transport {
        namespace: ctx.namespace,
        reason: FailureReason::Network,
        message: "connection lost".to_string(),
    };
    inner.last_error = Some(error.clone());
    inner.state = ConnectionState::Error;
    tracing::warn!(namespace = %ctx.namespace, "connection lost");
    let _ = ctx.lifecycle_tx.send(LifecycleEvent {
        namespace: ctx.namespace,
        state: ConnectionState::Error,
        error: Some(error),
        session: inner.session,
    });
}
