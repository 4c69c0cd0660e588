//! Control surface exposed to schedulers and operators.
//!
//! `FleetHandle` is a cloneable handle that sends `Command`s to the
//! controller loop and awaits the reply on a oneshot channel. The loop is
//! the only writer of the node set; the handle never sees a live handle,
//! only snapshots.

use fleet_reconcile::LabelSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::node::{InvalidTransition, NodeId, NodeSnapshot, NodeState};

/// Default mailbox size for the controller loop.
pub const COMMAND_BUFFER: usize = 256;

/// Errors returned to control surface callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("node {node_id} is {state}")]
    InvalidState { node_id: NodeId, state: NodeState },

    #[error("node {0} is being reclaimed")]
    ReclaimPending(NodeId),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("controller stopped")]
    Stopped,
}

/// Demand view for one label-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandSnapshot {
    pub labels: LabelSet,
    pub required: u32,
    /// Eligible nodes in supply states plus outstanding provisioning calls.
    pub supplied: u32,
    /// Unmet demand waiting on the provisioning cap.
    pub queued: u32,
    /// Provisioning calls currently outstanding for this label-set.
    pub outstanding: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsatisfiable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

type Reply<T> = oneshot::Sender<T>;

/// Messages handled by the controller loop.
#[derive(Debug)]
pub enum Command {
    RequestCapacity {
        labels: LabelSet,
        count: u32,
        reply: Reply<()>,
    },
    ReportActivity {
        node_id: NodeId,
        reply: Reply<Result<(), SurfaceError>>,
    },
    ForceReclaim {
        node_id: NodeId,
        reply: Reply<Result<(), SurfaceError>>,
    },
    AssignWork {
        node_id: NodeId,
        reply: Reply<Result<(), SurfaceError>>,
    },
    CompleteWork {
        node_id: NodeId,
        reply: Reply<Result<(), SurfaceError>>,
    },
    ListNodes {
        reply: Reply<Vec<NodeSnapshot>>,
    },
    ListDemand {
        reply: Reply<Vec<DemandSnapshot>>,
    },
}

/// Handle for talking to a running controller.
#[derive(Debug, Clone)]
pub struct FleetHandle {
    tx: mpsc::Sender<Command>,
}

impl FleetHandle {
    /// Create a handle and the receiving end for the controller loop.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SurfaceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SurfaceError::Stopped)?;
        rx.await.map_err(|_| SurfaceError::Stopped)
    }

    /// Set the required capacity for a label-set. A count of zero removes it.
    pub async fn request_capacity(&self, labels: LabelSet, count: u32) -> Result<(), SurfaceError> {
        self.call(|reply| Command::RequestCapacity {
            labels,
            count,
            reply,
        })
        .await
    }

    pub async fn report_activity(&self, node_id: NodeId) -> Result<(), SurfaceError> {
        self.call(|reply| Command::ReportActivity { node_id, reply })
            .await?
    }

    pub async fn force_reclaim(&self, node_id: NodeId) -> Result<(), SurfaceError> {
        self.call(|reply| Command::ForceReclaim { node_id, reply })
            .await?
    }

    /// Mark an idle node busy.
    pub async fn assign_work(&self, node_id: NodeId) -> Result<(), SurfaceError> {
        self.call(|reply| Command::AssignWork { node_id, reply })
            .await?
    }

    /// Mark a busy node idle again.
    pub async fn complete_work(&self, node_id: NodeId) -> Result<(), SurfaceError> {
        self.call(|reply| Command::CompleteWork { node_id, reply })
            .await?
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, SurfaceError> {
        self.call(|reply| Command::ListNodes { reply }).await
    }

    pub async fn get_node(&self, node_id: &NodeId) -> Result<NodeSnapshot, SurfaceError> {
        self.list_nodes()
            .await?
            .into_iter()
            .find(|node| &node.id == node_id)
            .ok_or_else(|| SurfaceError::NotFound(node_id.clone()))
    }

    pub async fn list_demand(&self) -> Result<Vec<DemandSnapshot>, SurfaceError> {
        self.call(|reply| Command::ListDemand { reply }).await
    }
}
