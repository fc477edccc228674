use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::FailureReason;
use crate::model::Namespace;

/// An open physical channel, as a pair of frame queues.
///
/// The link is considered lost when `inbound` yields `None`. Dropping
/// `outbound` asks the transport to close.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl TransportFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Network,
            message: message.into(),
        }
    }
}

/// Abstraction over the physical channel for testability.
/// Real implementation: `WebSocketTransport`. Test double: `MemoryTransport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        namespace: Namespace,
    ) -> Result<TransportLink, TransportFailure>;
}

/// `<endpoint>/<namespace>`
pub fn namespace_url(endpoint: &str, namespace: Namespace) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), namespace.as_str())
}
