//! In-process transport.
//!
//! Every `open` hands the server half of the link to whoever holds the
//! transport, as a [`MemoryPeer`]. Used by tests and by hosts that embed a
//! server in the same process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::transport::{Transport, TransportFailure, TransportLink};
use crate::errors::FailureReason;
use crate::model::{ClientFrame, Namespace, RoomKey, ServerFrame};

#[derive(Default)]
struct MemoryState {
    scripted_failures: VecDeque<FailureReason>,
    opens: HashMap<Namespace, u32>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            peers_tx,
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// Make the next `open` fail with `reason`. Failures queue up.
    pub fn fail_next(&self, reason: FailureReason) {
        self.state.lock().scripted_failures.push_back(reason);
    }

    /// Number of `open` calls seen for a namespace, failed ones included.
    pub fn open_count(&self, namespace: Namespace) -> u32 {
        self.state.lock().opens.get(&namespace).copied().unwrap_or(0)
    }

    /// Wait for the server half of the next successfully opened link.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        _endpoint: &str,
        namespace: Namespace,
    ) -> Result<TransportLink, TransportFailure> {
        let failure = {
            let mut state = self.state.lock();
            *state.opens.entry(namespace).or_insert(0) += 1;
            state.scripted_failures.pop_front()
        };
        if let Some(reason) = failure {
            return Err(TransportFailure {
                reason,
                message: format!("scripted {} failure", reason),
            });
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            namespace,
            to_client: server_tx,
            from_client: server_rx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| TransportFailure::network("memory transport has no listener"))?;

        Ok(TransportLink {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

/// Server half of an in-memory link. Dropping it severs the link.
pub struct MemoryPeer {
    pub namespace: Namespace,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Next frame from the client; `None` once the client closed the link.
    /// Undecodable frames are skipped.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        while let Some(text) = self.from_client.recv().await {
            if let Ok(frame) = ClientFrame::decode(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(frame) = ClientFrame::decode(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Drain every frame already sent by the client.
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn send(&self, frame: &ServerFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.to_client.send(text).is_ok(),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn send_event(&self, event: &str, payload: Value) -> bool {
        self.send(&ServerFrame::Event {
            event: event.to_string(),
            payload,
        })
    }

    /// Wait for the credential handshake and accept it. Returns the token.
    pub async fn accept(&mut self, user_id: &str) -> Option<String> {
        loop {
            match self.recv().await? {
                ClientFrame::Authenticate { token } => {
                    self.send(&ServerFrame::AuthOk {
                        user_id: user_id.to_string(),
                    });
                    return Some(token);
                }
                _ => continue,
            }
        }
    }

    /// Wait for the credential handshake and reject it.
    pub async fn reject(&mut self, reason: &str) -> Option<String> {
        loop {
            if let ClientFrame::Authenticate { token } = self.recv().await? {
                self.send(&ServerFrame::AuthRejected {
                    reason: reason.to_string(),
                });
                return Some(token);
            }
        }
    }

    /// Rooms joined in the frames drained so far.
    pub fn joined_rooms(frames: &[ClientFrame]) -> Vec<RoomKey> {
        frames
            .iter()
            .filter_map(|f| match f {
                ClientFrame::JoinRoom { room } => Some(room.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_hands_out_peer() {
        let transport = MemoryTransport::new();
        let mut link = transport.open("mem://", Namespace::Board).await.unwrap();
        let mut peer = transport.next_peer().await.unwrap();
        assert_eq!(peer.namespace, Namespace::Board);

        link.outbound
            .send(
                ClientFrame::JoinRoom {
                    room: RoomKey::board("1"),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        assert_eq!(
            peer.recv().await,
            Some(ClientFrame::JoinRoom {
                room: RoomKey::board("1")
            })
        );

        assert!(peer.send_event("task:deleted", serde_json::json!({})));
        assert!(link.inbound.recv().await.is_some());

        drop(peer);
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let transport = MemoryTransport::new();
        transport.fail_next(FailureReason::Network);
        transport.fail_next(FailureReason::Timeout);

        let first = transport.open("mem://", Namespace::Ai).await.err().unwrap();
        assert_eq!(first.reason, FailureReason::Network);
        let second = transport.open("mem://", Namespace::Ai).await.err().unwrap();
        assert_eq!(second.reason, FailureReason::Timeout);
        assert!(transport.open("mem://", Namespace::Ai).await.is_ok());
        assert_eq!(transport.open_count(Namespace::Ai), 3);
    }
}
