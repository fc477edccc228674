//! Reconnection & Resubscription Controller.
//!
//! ```text
//! Idle ──start──> Connecting ──> Connected ──> Authenticating ──> Ready
//!                                                                  │ link lost
//!   Failed <── budget spent ── Degraded <──────────────────────────┘
//!                                │ retry timer
//!                                v
//!                           Reconnecting ──> Connected ──> ... ──> Ready (resync)
//! ```
//!
//! [`ReconnectMachine`] is the pure transition function: inputs in, actions
//! out, no I/O. [`ReconnectController`] is the task that feeds it lifecycle
//! events, credential changes and retry timers, and carries out its actions
//! against a [`ConnectionManager`].

pub mod credentials;

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Sleep};

use crate::connection::{ConnectionManager, ConnectionState, LifecycleEvent};
use crate::dispatch::EventDispatcher;
use crate::errors::{FailureReason, SyncError};
use crate::model::Namespace;
use crate::rooms::RoomSubscriptionTracker;
use crate::sync_config::SyncConfig;

pub use credentials::{Credential, CredentialSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Degraded,
    Reconnecting,
    Failed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The owning context became active.
    Start { credential: bool },
    TransportUp,
    AuthRequested,
    Authenticated,
    ConnectionError(SyncError),
    RetryElapsed,
    CredentialChanged { present: bool },
    /// The owning context went away.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect,
    ScheduleRetry(Duration),
    /// Re-join every intended room. `resync` is set when this follows a loss.
    Replay { resync: bool },
    Disconnect,
    Surface(SyncError),
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect.base_delay_ms),
            max: Duration::from_millis(config.reconnect.max_delay_ms),
        }
    }

    /// Upper bound of the delay before retry `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

/// Per-namespace connection lifecycle, as a pure state machine.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    namespace: Namespace,
    state: ControllerState,
    active: bool,
    /// Failed attempts since the last `Ready`.
    attempts: u32,
    budget: Option<u32>,
    backoff: Backoff,
    reached_ready: bool,
    last_error: Option<SyncError>,
}

impl ReconnectMachine {
    pub fn new(namespace: Namespace, config: &SyncConfig) -> Self {
        Self {
            namespace,
            state: ControllerState::Idle,
            active: false,
            attempts: 0,
            budget: config.retry_budget(namespace),
            backoff: Backoff::from_config(config),
            reached_ready: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        use ControllerState as S;

        let before = self.state;
        let actions = match (self.state, input) {
            (S::Idle | S::Failed, Input::Start { credential }) => {
                self.active = true;
                self.attempts = 0;
                if credential {
                    self.state = S::Connecting;
                    vec![Action::Connect]
                } else {
                    self.state = S::Idle;
                    Vec::new()
                }
            }
            (_, Input::Start { .. }) => Vec::new(),

            (_, Input::Stop) => {
                self.active = false;
                self.state = S::Idle;
                self.attempts = 0;
                vec![Action::Disconnect]
            }

            (_, Input::CredentialChanged { present }) => {
                if !self.active {
                    Vec::new()
                } else if present {
                    self.attempts = 0;
                    self.state = S::Connecting;
                    vec![Action::Disconnect, Action::Connect]
                } else {
                    self.state = S::Idle;
                    vec![Action::Disconnect]
                }
            }

            (S::Connecting | S::Reconnecting, Input::TransportUp) => {
                self.state = S::Connected;
                Vec::new()
            }
            (S::Connected, Input::AuthRequested) => {
                self.state = S::Authenticating;
                Vec::new()
            }
            (S::Connecting | S::Connected | S::Authenticating | S::Reconnecting, Input::Authenticated) => {
                let resync = self.reached_ready;
                self.state = S::Ready;
                self.attempts = 0;
                self.reached_ready = true;
                self.last_error = None;
                vec![Action::Replay { resync }]
            }

            (S::Idle | S::Failed, Input::ConnectionError(_)) => Vec::new(),
            (_, Input::ConnectionError(error)) => self.on_error(error),

            (S::Degraded, Input::RetryElapsed) => {
                self.state = S::Reconnecting;
                vec![Action::Connect]
            }

            _ => Vec::new(),
        };

        if self.state != before {
            tracing::debug!(
                namespace = %self.namespace,
                from = %before,
                to = %self.state,
                attempts = self.attempts,
                "controller transition"
            );
        }
        actions
    }

    fn on_error(&mut self, error: SyncError) -> Vec<Action> {
        self.last_error = Some(error.clone());

        if !error.is_retryable() {
            self.state = ControllerState::Failed;
            return vec![Action::Disconnect, Action::Surface(error)];
        }

        self.attempts += 1;
        if let Some(budget) = self.budget
            && self.attempts > budget
        {
            self.state = ControllerState::Failed;
            return vec![Action::Disconnect, Action::Surface(error)];
        }

        self.state = ControllerState::Degraded;
        vec![Action::ScheduleRetry(self.backoff.delay(self.attempts))]
    }
}

/// What the controller reports to status watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub namespace: Namespace,
    pub state: ControllerState,
    pub attempts: u32,
    pub last_error: Option<SyncError>,
}

impl ControllerStatus {
    fn of(machine: &ReconnectMachine) -> Self {
        Self {
            namespace: machine.namespace,
            state: machine.state,
            attempts: machine.attempts,
            last_error: machine.last_error.clone(),
        }
    }
}

/// Everything the controller acts on.
pub struct ControllerDeps {
    pub connection: Arc<ConnectionManager>,
    pub tracker: Arc<RoomSubscriptionTracker>,
    /// Present for namespaces with reconciled state.
    pub dispatcher: Option<Arc<EventDispatcher>>,
    pub credentials: CredentialSource,
    pub errors: broadcast::Sender<SyncError>,
}

enum ControlCommand {
    Start,
    Stop,
}

/// Handle to a running controller task.
pub struct ReconnectController {
    namespace: Namespace,
    commands: mpsc::UnboundedSender<ControlCommand>,
    status_rx: watch::Receiver<ControllerStatus>,
    task: JoinHandle<()>,
}

impl ReconnectController {
    pub fn spawn(machine: ReconnectMachine, deps: ControllerDeps) -> Self {
        let namespace = machine.namespace;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ControllerStatus::of(&machine));

        let driver = Driver {
            machine,
            lifecycle: deps.connection.subscribe_lifecycle(),
            deps,
            status_tx,
            connecting: None,
        };
        let task = tokio::spawn(driver.run(commands_rx));

        Self {
            namespace,
            commands,
            status_rx,
            task,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The owning context is active: connect if a credential is available.
    pub fn start(&self) {
        let _ = self.commands.send(ControlCommand::Start);
    }

    /// The owning context is gone: disconnect and go idle.
    pub fn stop(&self) {
        let _ = self.commands.send(ControlCommand::Stop);
    }

    pub fn status(&self) -> ControllerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status_rx.clone()
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    machine: ReconnectMachine,
    deps: ControllerDeps,
    lifecycle: broadcast::Receiver<LifecycleEvent>,
    status_tx: watch::Sender<ControllerStatus>,
    connecting: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        let namespace = self.machine.namespace;
        let mut credentials = self.deps.credentials.subscribe();
        let _ = credentials.borrow_and_update();
        let mut credentials_open = true;
        let mut retry: Option<Pin<Box<Sleep>>> = None;

        loop {
            let inputs = tokio::select! {
                command = commands.recv() => match command {
                    Some(ControlCommand::Start) => vec![Input::Start {
                        credential: credentials.borrow().is_some(),
                    }],
                    Some(ControlCommand::Stop) => vec![Input::Stop],
                    None => break,
                },

                event = self.lifecycle.recv() => match event {
                    Ok(event) => lifecycle_inputs(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(namespace = %namespace, skipped, "lifecycle events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                changed = credentials.changed(), if credentials_open => match changed {
                    Ok(()) => vec![Input::CredentialChanged {
                        present: credentials.borrow_and_update().is_some(),
                    }],
                    Err(_) => {
                        credentials_open = false;
                        continue;
                    }
                },

                () = async {
                    match retry.as_mut() {
                        Some(sleep) => sleep.await,
                        None => pending().await,
                    }
                }, if retry.is_some() => {
                    retry = None;
                    vec![Input::RetryElapsed]
                }
            };

            for input in inputs {
                for action in self.machine.handle(input) {
                    self.execute(action, &mut retry);
                }
            }
            self.status_tx.send_if_modified(|status| {
                let next = ControllerStatus::of(&self.machine);
                if *status == next {
                    false
                } else {
                    *status = next;
                    true
                }
            });
        }

        self.execute(Action::Disconnect, &mut retry);
        tracing::debug!(namespace = %namespace, "controller stopped");
    }

    fn execute(&mut self, action: Action, retry: &mut Option<Pin<Box<Sleep>>>) {
        let namespace = self.machine.namespace;
        match action {
            Action::Connect => {
                let Some(credential) = self.deps.credentials.current() else {
                    tracing::debug!(namespace = %namespace, "no credential, staying idle");
                    return;
                };
                if let Some(previous) = self.connecting.take() {
                    previous.abort();
                }
                let connection = Arc::clone(&self.deps.connection);
                self.connecting = Some(tokio::spawn(async move {
                    // Failures arrive as lifecycle events
                    let _ = connection.connect(&credential).await;
                }));
            }
            Action::ScheduleRetry(delay) => {
                tracing::warn!(
                    namespace = %namespace,
                    attempt = self.machine.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                *retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::Replay { resync } => {
                let dispatcher = self.deps.dispatcher.clone();
                let joined = self.deps.tracker.replay_with(namespace, |room| {
                    if let Some(dispatcher) = &dispatcher {
                        let _ = dispatcher.begin_resync(room.clone());
                    }
                });
                if resync && let Some(dispatcher) = &dispatcher {
                    let _ = dispatcher.expire();
                }
                tracing::info!(namespace = %namespace, rooms = joined.len(), resync, "ready");
            }
            Action::Disconnect => {
                *retry = None;
                if let Some(connecting) = self.connecting.take() {
                    connecting.abort();
                }
                self.deps.connection.disconnect();
            }
            Action::Surface(error) => {
                tracing::error!(namespace = %namespace, error = %error, "connection failed permanently");
                let _ = self.deps.errors.send(error);
            }
        }
    }
}

/// Translate a connection lifecycle event into machine inputs.
fn lifecycle_inputs(event: LifecycleEvent) -> Vec<Input> {
    match event.state {
        ConnectionState::Connected => vec![Input::TransportUp, Input::AuthRequested],
        ConnectionState::Authenticated => vec![Input::Authenticated],
        ConnectionState::Error => {
            let error = event.error.unwrap_or(SyncError::Transport {
                namespace: event.namespace,
                reason: FailureReason::Network,
                message: "connection error".to_string(),
            });
            vec![Input::ConnectionError(error)]
        }
        ConnectionState::Connecting | ConnectionState::Disconnected => Vec::new(),
    }
}
