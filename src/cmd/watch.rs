//! Live watch command (`boardsync watch`).
//!
//! Notices are printed to stdout as JSON lines; status changes and errors go
//! through the log.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use boardsync::connection::WebSocketTransport;
use boardsync::model::{Namespace, RoomKey};
use boardsync::reconnect::{Credential, CredentialSource};
use boardsync::sync_config::SyncConfig;
use boardsync::SyncEngine;

pub struct WatchArgs {
    pub boards: Vec<String>,
    pub workspaces: Vec<String>,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub user: String,
}

pub async fn cmd_watch(config_path: &Path, args: WatchArgs) -> Result<()> {
    let mut config = SyncConfig::load_or_default(config_path)?;
    if let Some(endpoint) = args.endpoint {
        config.transport.endpoint = endpoint;
    }
    config.validate().context("Invalid configuration")?;

    let token = args
        .token
        .filter(|t| !t.trim().is_empty())
        .context("No access token: pass --token or set BOARDSYNC_TOKEN")?;

    let credentials = CredentialSource::new(Some(Credential::new(token, args.user.clone())));
    let engine = SyncEngine::new(
        config.clone(),
        Arc::new(WebSocketTransport),
        credentials,
        args.user.clone(),
    );

    let mut errors = engine.subscribe_errors();
    let mut notices = engine.subscribe_notices();
    let mut events = engine.subscribe_events();

    let ctx = engine.open_context();
    for board in &args.boards {
        engine.join(ctx, Namespace::Board, RoomKey::board(board))?;
    }
    for workspace in &args.workspaces {
        engine.join(ctx, Namespace::Workspace, RoomKey::workspace(workspace))?;
    }
    engine.join(ctx, Namespace::Notifications, RoomKey::notifications(&args.user))?;

    tracing::info!(
        endpoint = %config.transport.endpoint,
        boards = args.boards.len(),
        workspaces = args.workspaces.len(),
        "watching"
    );

    let mut status_watchers = Vec::new();
    for namespace in engine.namespaces() {
        if let Some(mut status) = engine.subscribe_status(namespace) {
            status_watchers.push(tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = status.borrow_and_update().clone();
                    tracing::info!(
                        namespace = %current.namespace,
                        state = %current.state,
                        attempts = current.attempts,
                        "status"
                    );
                }
            }));
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }

            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", serde_json::to_string(&notice)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notices lagged");
                }
                Err(RecvError::Closed) => break,
            },

            error = errors.recv() => match error {
                Ok(error) => {
                    tracing::warn!(severity = ?error.severity(), error = %error, "sync problem");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "errors lagged");
                }
                Err(RecvError::Closed) => break,
            },

            event = events.recv() => match event {
                Ok(event) => {
                    tracing::info!(namespace = %event.namespace, event = %event.event.name(), "event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "events lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.close_context(ctx);
    engine.shutdown();
    for watcher in status_watchers {
        watcher.abort();
    }
    Ok(())
}
