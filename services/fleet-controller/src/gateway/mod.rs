//! Provisioning gateway interface.
//!
//! The gateway abstracts the cloud backend:
//! - Requesting, resuming, suspending and destroying nodes
//! - Looking up a node's backend status and agent endpoint
//!
//! The controller is written against `ProvisioningGateway` only. One
//! implementation exists per backend; an in-memory mock is provided for
//! tests and development.

mod http;
mod mock;

use std::fmt;

use async_trait::async_trait;
use fleet_reconcile::LabelSet;
use serde::{Deserialize, Serialize};

use crate::error::{LookupError, ProvisionError, ReclaimError};
use crate::node::NodeId;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use mock::{MockGateway, MockNode};

/// What to provision. Opaque to the controller beyond these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub labels: LabelSet,
    pub image: String,
    pub size: String,
}

/// A node the backend has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedNode {
    pub id: NodeId,
    pub endpoint: Option<String>,
    pub handshake_token: Option<String>,
}

/// Backend status, mapped from vendor strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Pending,
    Running,
    Suspended,
    Terminated,
    Unknown,
}

impl BackendStatus {
    /// Map a vendor status string. Unmapped strings become `Unknown`.
    pub fn from_backend(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "provisioning" | "starting" | "booting" | "creating" | "resuming" => {
                Self::Pending
            }
            "running" | "active" | "ready" => Self::Running,
            "suspended" | "stopped" | "paused" | "hibernated" => Self::Suspended,
            "terminated" | "deleted" | "destroyed" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a status lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: BackendStatus,
    /// Agent endpoint (`host:port`) if the backend has one yet.
    pub endpoint: Option<String>,
}

/// Cloud backend capability set.
#[async_trait]
pub trait ProvisioningGateway: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Ask the backend for a new node.
    async fn request_node(&self, spec: &NodeSpec) -> Result<ProvisionedNode, ProvisionError>;

    /// Restart a suspended node. Resuming a running node succeeds.
    async fn resume_node(&self, id: &NodeId) -> Result<(), ProvisionError>;

    /// Suspend a node. Suspending a suspended node succeeds.
    async fn suspend_node(&self, id: &NodeId) -> Result<(), ReclaimError>;

    /// Destroy a node. Destroying a missing node succeeds.
    async fn destroy_node(&self, id: &NodeId) -> Result<(), ReclaimError>;

    /// Look up a node's backend status.
    async fn poll_status(&self, id: &NodeId) -> Result<StatusReport, LookupError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pending", BackendStatus::Pending)]
    #[case("PROVISIONING", BackendStatus::Pending)]
    #[case("Running", BackendStatus::Running)]
    #[case(" active ", BackendStatus::Running)]
    #[case("stopped", BackendStatus::Suspended)]
    #[case("suspended", BackendStatus::Suspended)]
    #[case("terminated", BackendStatus::Terminated)]
    #[case("deleted", BackendStatus::Terminated)]
    #[case("rebooting", BackendStatus::Unknown)]
    #[case("", BackendStatus::Unknown)]
    fn test_status_mapping(#[case] raw: &str, #[case] expected: BackendStatus) {
        assert_eq!(BackendStatus::from_backend(raw), expected);
    }
}
