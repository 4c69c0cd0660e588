//! Node handles and the node lifecycle state machine.
//!
//! A `NodeHandle` is plain data: identity, labels, lifecycle state and the
//! timestamps retention decisions are made from. It never holds a live
//! backend or agent session; those are obtained on demand through the
//! provisioning gateway and the launch coordinator.

use std::fmt;

use chrono::{DateTime, Utc};
use fleet_reconcile::{LabelSet, RetentionSubject};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend-assigned node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Provisioning has been requested from the backend.
    Requested,
    /// The backend accepted the request and is allocating the node.
    Provisioning,
    /// The node is running and the agent handshake is in progress.
    Launching,
    /// Ready for work.
    Idle,
    /// Running work.
    Busy,
    Suspending,
    Suspended,
    Destroying,
    Destroyed,
    Failed,
}

impl NodeState {
    pub const ALL: [NodeState; 10] = [
        Self::Requested,
        Self::Provisioning,
        Self::Launching,
        Self::Idle,
        Self::Busy,
        Self::Suspending,
        Self::Suspended,
        Self::Destroying,
        Self::Destroyed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Launching => "launching",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Terminal states: the node is never reused.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// States that count as supply toward demand.
    pub fn is_supply(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Busy | Self::Provisioning | Self::Launching
        )
    }

    /// Whether the lifecycle graph has an edge from `self` to `to`.
    pub fn can_transition_to(&self, to: NodeState) -> bool {
        use NodeState::*;

        matches!(
            (self, to),
            (Requested, Provisioning)
                | (Provisioning, Launching)
                | (Provisioning, Failed)
                | (Launching, Idle)
                | (Launching, Failed)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Suspending)
                | (Idle, Destroying)
                | (Suspending, Suspended)
                | (Destroying, Destroyed)
                | (Suspended, Provisioning)
                | (Failed, Destroying)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition not present in the lifecycle graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for node {node_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub node_id: NodeId,
    pub from: NodeState,
    pub to: NodeState,
}

/// Identity and status record for one provisioned node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    label_set: LabelSet,
    state: NodeState,
    stop_on_reclaim: bool,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,

    /// Image the node was provisioned from.
    pub image: String,

    /// Instance size the node was provisioned with.
    pub size: String,

    /// Last agent endpoint reported by the backend.
    pub endpoint: Option<String>,

    /// Token presented in the agent handshake.
    pub handshake_token: Option<String>,

    /// Most recent failure, for operators.
    pub last_error: Option<String>,

    /// An operator asked for this node to be reclaimed.
    pub reclaim_requested: bool,

    /// A non-retryable reclaim error occurred; retries wait for the operator.
    pub reclaim_blocked: bool,
}

impl NodeHandle {
    /// Create a handle for a node the backend has just allocated.
    pub fn new(
        id: NodeId,
        label_set: LabelSet,
        stop_on_reclaim: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            label_set,
            state: NodeState::Requested,
            stop_on_reclaim,
            created_at,
            last_activity_at: created_at,
            image: String::new(),
            size: String::new(),
            endpoint: None,
            handshake_token: None,
            last_error: None,
            reclaim_requested: false,
            reclaim_blocked: false,
        }
    }

    /// Rebuild a handle from a checkpoint record in a given state.
    pub fn restore(
        id: NodeId,
        label_set: LabelSet,
        state: NodeState,
        stop_on_reclaim: bool,
        created_at: DateTime<Utc>,
        last_activity_at: DateTime<Utc>,
    ) -> Self {
        let mut handle = Self::new(id, label_set, stop_on_reclaim, created_at);
        handle.state = state;
        handle.last_activity_at = last_activity_at;
        handle
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn label_set(&self) -> &LabelSet {
        &self.label_set
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn stop_on_reclaim(&self) -> bool {
        self.stop_on_reclaim
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Move to `to` if the lifecycle graph allows it.
    pub fn transition(&mut self, to: NodeState) -> Result<(), InvalidTransition> {
        self.transition_at(to, Utc::now())
    }

    /// Move to `to`, stamping `now` as the last activity.
    ///
    /// On rejection the handle is left untouched.
    pub fn transition_at(
        &mut self,
        to: NodeState,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                node_id: self.id.clone(),
                from: self.state,
                to,
            });
        }

        self.state = to;
        self.touch(now);
        Ok(())
    }

    /// Record activity without changing state.
    ///
    /// Timestamps never move backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Mark the node failed outside the normal graph.
    ///
    /// Used when handling the node hit an internal invariant violation;
    /// cleanup then proceeds through Failed -> Destroying. Terminal nodes
    /// are left as they are.
    pub fn force_fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = NodeState::Failed;
        self.last_error = Some(reason.into());
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            labels: self.label_set.clone(),
            state: self.state,
            stop_on_reclaim: self.stop_on_reclaim,
            image: self.image.clone(),
            size: self.size.clone(),
            endpoint: self.endpoint.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            last_error: self.last_error.clone(),
            reclaim_requested: self.reclaim_requested,
            reclaim_blocked: self.reclaim_blocked,
        }
    }
}

impl RetentionSubject for NodeHandle {
    fn is_idle(&self) -> bool {
        self.state == NodeState::Idle
    }

    fn stop_on_reclaim(&self) -> bool {
        self.stop_on_reclaim
    }

    fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }
}

/// Point-in-time view of a node for operators and schedulers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub labels: LabelSet,
    pub state: NodeState,
    pub stop_on_reclaim: bool,
    pub image: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub reclaim_requested: bool,
    pub reclaim_blocked: bool,
}
