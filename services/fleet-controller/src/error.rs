//! Error taxonomy for backend and launch operations.

use thiserror::Error;

/// Errors from requesting or resuming a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// The backend refused the request because a quota is exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The backend could not be reached or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The node spec was rejected by the backend.
    #[error("invalid node spec: {0}")]
    InvalidSpec(String),
}

impl ProvisionError {
    /// Returns true if retrying later may succeed without configuration changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_) | Self::BackendUnavailable(_))
    }
}

/// Errors from suspending or destroying a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReclaimError {
    /// The node does not exist; treated as already reclaimed.
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl ReclaimError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Errors from looking up a node's backend status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Errors from bringing a node's agent online.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// Retries were exhausted before a handshake succeeded.
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    /// The agent answered but refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The agent could not be reached (transient, consumed an attempt).
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The backend reported the node gone or terminated mid-launch.
    #[error("node lost during launch: {0}")]
    NodeLost(String),
}
