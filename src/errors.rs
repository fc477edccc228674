//! Typed error hierarchy for the synchronization engine.
//!
//! `SyncError` covers everything the engine surfaces to its host:
//! - connectivity problems (`Transport`, `AuthRejected`) feed the reconnection
//!   state machine and the status indicator
//! - resource limits (`CapacityExceeded`) are returned to the caller
//! - data-level problems (`OrphanEvent`, `MalformedEvent`, `OptimisticTimeout`)
//!   stay inside the reconciliation layer and are reported on the error channel

use std::fmt;

use thiserror::Error;

use crate::model::{EntityKind, Namespace};

/// Why a connection attempt or live connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Network,
    AuthRejected,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::AuthRejected => "auth-rejected",
            Self::Timeout => "timeout",
        }
    }

    /// Auth rejections are never retried with the same credential.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthRejected)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded resources that can reject work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Namespaces,
    EmitBuffer,
    OrphanBuffer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Namespaces => "namespaces",
            Self::EmitBuffer => "emit buffer",
            Self::OrphanBuffer => "orphan buffer",
        })
    }
}

/// How an error should reach the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Non-blocking status indicator.
    Connectivity,
    /// Soft, dismissible warning.
    DataWarning,
    /// Dismissible notice about data that could not be applied.
    DataError,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Transport error on {namespace} ({reason}): {message}")]
    Transport {
        namespace: Namespace,
        reason: FailureReason,
        message: String,
    },

    #[error("Credential rejected on {namespace}: {reason}")]
    AuthRejected { namespace: Namespace, reason: String },

    #[error("Capacity exceeded for {resource}: limit is {limit}")]
    CapacityExceeded { resource: Resource, limit: usize },

    #[error("Dropped {entity_kind} {entity_id}: parent {parent_id} not found after {attempts} attempts")]
    OrphanEvent {
        entity_kind: EntityKind,
        entity_id: String,
        parent_id: String,
        attempts: u32,
    },

    #[error("Optimistic {entity_kind} change {local_id} was not confirmed in time and was rolled back")]
    OptimisticTimeout {
        local_id: String,
        entity_kind: EntityKind,
        entity_id: String,
    },

    #[error("Server rejected change {local_id}: {reason}")]
    MutationRejected { local_id: String, reason: String },

    #[error("Malformed {event} event: {reason}")]
    MalformedEvent { event: String, reason: String },

    #[error("Namespace {namespace} is not authenticated")]
    NotAuthenticated { namespace: Namespace },

    #[error("Dispatcher for {namespace} has shut down")]
    DispatcherClosed { namespace: Namespace },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Transport { .. } | Self::AuthRejected { .. } | Self::NotAuthenticated { .. } => {
                Severity::Connectivity
            }
            Self::OptimisticTimeout { .. }
            | Self::MutationRejected { .. }
            | Self::CapacityExceeded { .. } => Severity::DataWarning,
            Self::OrphanEvent { .. }
            | Self::MalformedEvent { .. }
            | Self::DispatcherClosed { .. }
            | Self::Encode(_) => Severity::DataError,
        }
    }

    /// Whether the reconnection controller should keep trying after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { reason, .. } => reason.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_is_retryable_unless_auth() {
        let err = SyncError::Transport {
            namespace: Namespace::Board,
            reason: FailureReason::Timeout,
            message: "no answer".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.severity(), Severity::Connectivity);

        let err = SyncError::AuthRejected {
            namespace: Namespace::Board,
            reason: "expired".into(),
        };
        assert!(!err.is_retryable());
        assert!(!FailureReason::AuthRejected.is_retryable());
    }

    #[test]
    fn orphan_event_carries_ids() {
        let err = SyncError::OrphanEvent {
            entity_kind: EntityKind::Task,
            entity_id: "t9".into(),
            parent_id: "c404".into(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("t9"));
        assert!(msg.contains("c404"));
        assert_eq!(err.severity(), Severity::DataError);
    }

    #[test]
    fn capacity_exceeded_names_resource() {
        let err = SyncError::CapacityExceeded {
            resource: Resource::EmitBuffer,
            limit: 50,
        };
        assert_eq!(err.to_string(), "Capacity exceeded for emit buffer: limit is 50");
        assert_eq!(err.severity(), Severity::DataWarning);
    }

    #[test]
    fn optimistic_timeout_is_soft() {
        let err = SyncError::OptimisticTimeout {
            local_id: "tmp-1".into(),
            entity_kind: EntityKind::Task,
            entity_id: "tmp-1".into(),
        };
        assert_eq!(err.severity(), Severity::DataWarning);
        assert!(!err.is_retryable());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SyncError::Encode("x".into()));
    }
}
