//! In-memory gateway for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{BackendStatus, NodeSpec, ProvisionedNode, ProvisioningGateway, StatusReport};
use crate::error::{LookupError, ProvisionError, ReclaimError};
use crate::node::NodeId;

/// A node as the mock backend sees it.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub spec: NodeSpec,
    pub status: BackendStatus,
    pub endpoint: Option<String>,
    /// Polls left that report `Pending` before the node turns `Running`.
    pub pending_polls: u32,
}

#[derive(Default)]
struct MockState {
    nodes: HashMap<NodeId, MockNode>,
    request_errors: VecDeque<ProvisionError>,
    sticky_request_error: Option<ProvisionError>,
    reclaim_error: Option<ReclaimError>,
    lookup_error: Option<LookupError>,
    destroy_calls: HashMap<NodeId, u64>,
    suspend_calls: HashMap<NodeId, u64>,
}

/// Mock backend.
///
/// Nodes are "allocated" instantly. Failures, boot delays and call latency
/// can be injected to exercise the controller's error handling.
pub struct MockGateway {
    state: Mutex<MockState>,

    /// Counter for generating node IDs.
    node_counter: AtomicU64,

    /// Polls reporting `Pending` for each new node.
    boot_polls: AtomicU64,

    /// Artificial latency added to every call, in milliseconds.
    latency_ms: AtomicU64,

    request_calls: AtomicU64,
    resume_calls: AtomicU64,
    poll_calls: AtomicU64,
}

impl MockGateway {
    /// Create a new mock gateway.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            node_counter: AtomicU64::new(0),
            boot_polls: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            request_calls: AtomicU64::new(0),
            resume_calls: AtomicU64::new(0),
            poll_calls: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `request_node` call with `err`. Errors queue up.
    pub fn push_request_error(&self, err: ProvisionError) {
        self.lock().request_errors.push_back(err);
    }

    /// Fail every `request_node` call until cleared.
    pub fn set_request_error(&self, err: Option<ProvisionError>) {
        self.lock().sticky_request_error = err;
    }

    /// Fail every `suspend_node` / `destroy_node` call until cleared.
    pub fn set_reclaim_error(&self, err: Option<ReclaimError>) {
        self.lock().reclaim_error = err;
    }

    /// Fail every `poll_status` call until cleared.
    pub fn set_lookup_error(&self, err: Option<LookupError>) {
        self.lock().lookup_error = err;
    }

    /// Number of polls new nodes report `Pending` before `Running`.
    pub fn set_boot_polls(&self, polls: u32) {
        self.boot_polls.store(polls as u64, Ordering::SeqCst);
    }

    /// Add latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Insert a node directly, as if it existed before the controller started.
    pub fn insert_node(&self, id: NodeId, node: MockNode) {
        self.lock().nodes.insert(id, node);
    }

    pub fn node(&self, id: &NodeId) -> Option<MockNode> {
        self.lock().nodes.get(id).cloned()
    }

    pub fn status_of(&self, id: &NodeId) -> Option<BackendStatus> {
        self.lock().nodes.get(id).map(|n| n.status)
    }

    /// Nodes not terminated.
    pub fn live_node_count(&self) -> usize {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.status != BackendStatus::Terminated)
            .count()
    }

    pub fn request_calls(&self) -> u64 {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> u64 {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u64 {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self, id: &NodeId) -> u64 {
        self.lock().destroy_calls.get(id).copied().unwrap_or(0)
    }

    pub fn suspend_calls(&self, id: &NodeId) -> u64 {
        self.lock().suspend_calls.get(id).copied().unwrap_or(0)
    }

    fn next_node_id(&self) -> NodeId {
        let counter = self.node_counter.fetch_add(1, Ordering::SeqCst);
        NodeId::new(format!("mock-{:06}", counter))
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn request_node(&self, spec: &NodeSpec) -> Result<ProvisionedNode, ProvisionError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        {
            let mut state = self.lock();
            if let Some(err) = state.request_errors.pop_front() {
                return Err(err);
            }
            if let Some(err) = state.sticky_request_error.clone() {
                return Err(err);
            }
        }

        let id = self.next_node_id();
        let endpoint = format!("{}.mock.internal:7100", id);
        let node = MockNode {
            spec: spec.clone(),
            status: BackendStatus::Pending,
            endpoint: Some(endpoint.clone()),
            pending_polls: self.boot_polls.load(Ordering::SeqCst) as u32,
        };

        info!(
            node_id = %id,
            labels = %spec.labels,
            image = %spec.image,
            size = %spec.size,
            "[MOCK] Node requested"
        );

        self.lock().nodes.insert(id.clone(), node);

        Ok(ProvisionedNode {
            handshake_token: Some(format!("token-{}", id)),
            endpoint: Some(endpoint),
            id,
        })
    }

    async fn resume_node(&self, id: &NodeId) -> Result<(), ProvisionError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.lock();
        let boot_polls = self.boot_polls.load(Ordering::SeqCst) as u32;
        match state.nodes.get_mut(id) {
            Some(node) if node.status == BackendStatus::Terminated => Err(
                ProvisionError::InvalidSpec(format!("node {} is terminated", id)),
            ),
            Some(node) => {
                if node.status == BackendStatus::Suspended {
                    node.status = BackendStatus::Pending;
                    node.pending_polls = boot_polls;
                }
                info!(node_id = %id, "[MOCK] Node resumed");
                Ok(())
            }
            None => Err(ProvisionError::InvalidSpec(format!("node {} not found", id))),
        }
    }

    async fn suspend_node(&self, id: &NodeId) -> Result<(), ReclaimError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        *state.suspend_calls.entry(id.clone()).or_insert(0) += 1;
        if let Some(err) = state.reclaim_error.clone() {
            return Err(err);
        }

        match state.nodes.get_mut(id) {
            Some(node) if node.status == BackendStatus::Terminated => {
                Err(ReclaimError::NotFound(id.to_string()))
            }
            Some(node) => {
                node.status = BackendStatus::Suspended;
                info!(node_id = %id, "[MOCK] Node suspended");
                Ok(())
            }
            None => Err(ReclaimError::NotFound(id.to_string())),
        }
    }

    async fn destroy_node(&self, id: &NodeId) -> Result<(), ReclaimError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        *state.destroy_calls.entry(id.clone()).or_insert(0) += 1;
        if let Some(err) = state.reclaim_error.clone() {
            return Err(err);
        }

        match state.nodes.get_mut(id) {
            Some(node) => {
                node.status = BackendStatus::Terminated;
                info!(node_id = %id, "[MOCK] Node destroyed");
            }
            None => debug!(node_id = %id, "[MOCK] Destroy of unknown node"),
        }
        Ok(())
    }

    async fn poll_status(&self, id: &NodeId) -> Result<StatusReport, LookupError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(err) = state.lookup_error.clone() {
            return Err(err);
        }

        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| LookupError::NotFound(id.to_string()))?;

        if node.status == BackendStatus::Pending {
            if node.pending_polls == 0 {
                node.status = BackendStatus::Running;
            } else {
                node.pending_polls -= 1;
            }
        }

        Ok(StatusReport {
            status: node.status,
            endpoint: node.endpoint.clone(),
        })
    }
}
