//! Fleet controller: owns the node set and drives it toward demand.
//!
//! Each tick:
//! 1. Drains completed gateway and launch results
//! 2. Provisions toward unmet demand, resuming suspended nodes first
//! 3. Asks the retention policy about every idle node
//! 4. Starts cleanup of failed nodes
//! 5. Issues suspend/destroy calls that are due (new or retried)
//!
//! Gateway calls and launches run as spawned tasks and report back on
//! channels; only the controller mutates handles. At most one call per
//! node id is outstanding at any time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_reconcile::{
    decide, decide_forced, BackoffPolicy, LabelSet, ProvisioningStrategy, RetentionDecision,
    RetentionPolicy, DEFAULT_PROVISION_TIMEOUT, DEFAULT_RECLAIM_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_TICK_INTERVAL,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{LookupError, ProvisionError, ReclaimError};
use crate::gateway::{BackendStatus, NodeSpec, ProvisionedNode, ProvisioningGateway};
use crate::launch::{AgentConnector, LaunchConfig, LaunchCoordinator, LaunchEvent, LaunchTarget};
use crate::node::{NodeHandle, NodeId, NodeSnapshot, NodeState};
use crate::state::{NodeRecord, StateStore, StateStoreError};
use crate::surface::{Command, DemandSnapshot, SurfaceError};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,

    /// Cap on outstanding provisioning calls.
    pub strategy: ProvisioningStrategy,

    /// Idle timeout for retention decisions.
    pub retention: RetentionPolicy,

    /// Whether new nodes are suspended rather than destroyed on reclaim.
    pub stop_on_reclaim: bool,

    /// Image for new nodes.
    pub node_image: String,

    /// Size for new nodes.
    pub node_size: String,

    /// Timeout for `request_node` / `resume_node`.
    pub provision_timeout: Duration,

    /// Timeout for `suspend_node` / `destroy_node` / `poll_status`.
    pub reclaim_timeout: Duration,

    /// Spacing of reclaim retries after transient failures.
    pub reclaim_backoff: BackoffPolicy,

    pub launch: LaunchConfig,

    /// How long shutdown waits for the fleet to be reclaimed.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            strategy: ProvisioningStrategy::default(),
            retention: RetentionPolicy::default(),
            stop_on_reclaim: false,
            node_image: "default".to_string(),
            node_size: "default".to_string(),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            reclaim_timeout: DEFAULT_RECLAIM_TIMEOUT,
            reclaim_backoff: BackoffPolicy::reclaim(),
            launch: LaunchConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Required capacity for one label-set.
#[derive(Debug, Clone, Default)]
struct DemandEntry {
    required: u32,
    queued: u32,
    /// Set by a non-retryable provisioning error; cleared by a new request.
    unsatisfiable: Option<String>,
    last_error: Option<String>,
}

/// Call outstanding for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Resume,
    Launch,
    Suspend,
    Destroy,
}

/// Transient reclaim failure bookkeeping.
#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_at: DateTime<Utc>,
}

/// Result of a spawned gateway call.
#[derive(Debug)]
enum GatewayOutcome {
    Provisioned {
        labels: LabelSet,
        result: Result<ProvisionedNode, ProvisionError>,
    },
    Resumed {
        node_id: NodeId,
        result: Result<(), ProvisionError>,
    },
    Reclaimed {
        node_id: NodeId,
        operation: Operation,
        result: Result<(), ReclaimError>,
    },
}

#[derive(Debug)]
enum Event {
    Gateway(GatewayOutcome),
    Launch(LaunchEvent),
}

enum Step {
    Tick,
    Command(Command),
    Event(Event),
    Noop,
    Shutdown,
}

/// Outcome of restart reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub relaunched: usize,
    pub dropped: usize,
}

/// Outcome of shutdown reclamation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reclaimed: usize,
    pub abandoned: Vec<NodeId>,
}

/// Fleet controller.
pub struct FleetController {
    gateway: Arc<dyn ProvisioningGateway>,
    launcher: LaunchCoordinator,
    config: ControllerConfig,
    store: Option<StateStore>,

    nodes: BTreeMap<NodeId, NodeHandle>,
    demand: BTreeMap<LabelSet, DemandEntry>,

    /// Outstanding `request_node` calls per label-set.
    requests: BTreeMap<LabelSet, u32>,

    in_flight: HashMap<NodeId, Operation>,
    reclaim_retries: HashMap<NodeId, RetryState>,

    /// Provisioning nodes whose resume failed transiently.
    pending_resumes: Vec<NodeId>,

    launches: JoinSet<()>,
    gateway_tx: mpsc::UnboundedSender<GatewayOutcome>,
    gateway_rx: mpsc::UnboundedReceiver<GatewayOutcome>,
    launch_tx: mpsc::UnboundedSender<LaunchEvent>,
    launch_rx: mpsc::UnboundedReceiver<LaunchEvent>,

    shutting_down: bool,
}

impl FleetController {
    /// Create a controller with an empty node set.
    pub fn new(
        gateway: Arc<dyn ProvisioningGateway>,
        connector: Arc<dyn AgentConnector>,
        config: ControllerConfig,
    ) -> Self {
        let launcher = LaunchCoordinator::new(gateway.clone(), connector, config.launch.clone());
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();

        Self {
            gateway,
            launcher,
            config,
            store: None,
            nodes: BTreeMap::new(),
            demand: BTreeMap::new(),
            requests: BTreeMap::new(),
            in_flight: HashMap::new(),
            reclaim_retries: HashMap::new(),
            pending_resumes: Vec::new(),
            launches: JoinSet::new(),
            gateway_tx,
            gateway_rx,
            launch_tx,
            launch_rx,
            shutting_down: false,
        }
    }

    /// Checkpoint every state change to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeHandle> {
        self.nodes.get(id)
    }

    /// No gateway call or launch is outstanding.
    pub fn is_quiet(&self) -> bool {
        self.in_flight.is_empty() && self.outstanding_requests() == 0
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Run until shutdown, then reclaim the fleet within the grace period.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::Receiver<Command>,
    ) -> ShutdownReport {
        info!(
            gateway = self.gateway.name(),
            tick_interval_secs = self.config.tick_interval.as_secs(),
            provision_cap = self.config.strategy.max_concurrent,
            idle_timeout_secs = self.config.retention.idle_timeout.as_secs(),
            "Starting fleet controller"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = interval.tick() => Step::Tick,
                Some(cmd) = commands.recv() => Step::Command(cmd),
                Some(event) = Self::recv_event(&mut self.gateway_rx, &mut self.launch_rx) => Step::Event(event),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Step::Shutdown
                    } else {
                        Step::Noop
                    }
                }
            };

            match step {
                Step::Tick => self.tick(),
                Step::Command(cmd) => self.handle_command(cmd),
                Step::Event(event) => self.handle_event(event, Utc::now()),
                Step::Noop => {}
                Step::Shutdown => {
                    info!("Fleet controller shutting down");
                    break;
                }
            }
        }

        let grace = self.config.shutdown_grace;
        self.shutdown(grace).await
    }

    async fn recv_event(
        gateway_rx: &mut mpsc::UnboundedReceiver<GatewayOutcome>,
        launch_rx: &mut mpsc::UnboundedReceiver<LaunchEvent>,
    ) -> Option<Event> {
        tokio::select! {
            Some(outcome) = gateway_rx.recv() => Some(Event::Gateway(outcome)),
            Some(event) = launch_rx.recv() => Some(Event::Launch(event)),
            else => None,
        }
    }

    /// Run one tick at the current time.
    pub fn tick(&mut self) {
        self.tick_at(Utc::now());
    }

    /// Run one tick at `now`.
    pub fn tick_at(&mut self, now: DateTime<Utc>) {
        self.drain_events(now);
        while self.launches.try_join_next().is_some() {}

        self.provision(now);
        self.apply_retention(now);
        self.cleanup_failed(now);
        self.issue_reclaims(now);

        debug!(
            nodes = self.nodes.len(),
            in_flight = self.in_flight.len(),
            outstanding = self.outstanding_requests(),
            "Tick complete"
        );
    }

    /// Handle events as they arrive until nothing is outstanding or `timeout`
    /// elapses. Returns whether the controller went quiet.
    pub async fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        while !self.is_quiet() {
            let event = tokio::time::timeout_at(
                deadline,
                Self::recv_event(&mut self.gateway_rx, &mut self.launch_rx),
            )
            .await;

            match event {
                Ok(Some(event)) => self.handle_event(event, Utc::now()),
                Ok(None) | Err(_) => break,
            }
        }

        self.is_quiet()
    }

    fn drain_events(&mut self, now: DateTime<Utc>) {
        while let Ok(outcome) = self.gateway_rx.try_recv() {
            self.handle_event(Event::Gateway(outcome), now);
        }
        while let Ok(event) = self.launch_rx.try_recv() {
            self.handle_event(Event::Launch(event), now);
        }
    }

    // =========================================================================
    // Tick phases
    // =========================================================================

    fn outstanding_requests(&self) -> u32 {
        self.requests.values().sum()
    }

    /// Outstanding calls counted against the provisioning cap.
    fn outstanding_provisioning(&self) -> u32 {
        let resumes = self
            .in_flight
            .values()
            .filter(|op| **op == Operation::Resume)
            .count() as u32;
        self.outstanding_requests() + resumes
    }

    /// Eligible nodes in supply states plus outstanding requests for `labels`.
    fn supplied(&self, labels: &LabelSet) -> u32 {
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.state().is_supply() && n.label_set().satisfies(labels))
            .count() as u32;
        nodes + self.requests.get(labels).copied().unwrap_or(0)
    }

    fn provision(&mut self, now: DateTime<Utc>) {
        // Resumes that failed transiently go first; they already count as supply
        // but still wait for room under the cap
        let mut deferred = Vec::new();
        for node_id in std::mem::take(&mut self.pending_resumes) {
            if self.nodes.get(&node_id).map(|n| n.state()) != Some(NodeState::Provisioning) {
                continue;
            }
            if self.outstanding_provisioning() < self.config.strategy.max_concurrent {
                self.spawn_resume(node_id);
            } else {
                deferred.push(node_id);
            }
        }
        self.pending_resumes = deferred;

        let label_sets: Vec<LabelSet> = self.demand.keys().cloned().collect();

        for labels in label_sets {
            let Some(entry) = self.demand.get(&labels) else {
                continue;
            };
            if let Some(reason) = &entry.unsatisfiable {
                debug!(label_set = %labels, reason = %reason, "Skipping unsatisfiable demand");
                continue;
            }

            let required = entry.required;
            let supplied = self.supplied(&labels);
            let plan = self
                .config
                .strategy
                .calculate(required, supplied, self.outstanding_provisioning());

            if plan.unmet() > 0 {
                info!(
                    label_set = %labels,
                    required,
                    supplied,
                    to_request = plan.to_request,
                    queued = plan.queued,
                    "Provisioning toward demand"
                );
            }

            for _ in 0..plan.to_request {
                match self.resumable_node(&labels) {
                    Some(node_id) => {
                        if self.transition(&node_id, NodeState::Provisioning, now) {
                            self.spawn_resume(node_id);
                        }
                    }
                    None => self.spawn_request(labels.clone()),
                }
            }

            if let Some(entry) = self.demand.get_mut(&labels) {
                entry.queued = plan.queued;
            }
        }
    }

    fn resumable_node(&self, labels: &LabelSet) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| {
                n.state() == NodeState::Suspended
                    && !n.reclaim_requested
                    && n.label_set().satisfies(labels)
                    && !self.in_flight.contains_key(n.id())
            })
            .map(|n| n.id().clone())
    }

    fn apply_retention(&mut self, now: DateTime<Utc>) {
        let candidates: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| {
                matches!(n.state(), NodeState::Idle | NodeState::Busy)
                    && !self.in_flight.contains_key(n.id())
            })
            .map(|n| n.id().clone())
            .collect();

        for node_id in candidates {
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };

            if node.reclaim_requested && node.state() == NodeState::Busy {
                info!(node_id = %node_id, "Releasing busy node for forced reclaim");
                if !self.transition(&node_id, NodeState::Idle, now) {
                    continue;
                }
            } else if node.state() == NodeState::Busy {
                continue;
            }

            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            let decision = if node.reclaim_requested {
                decide_forced(node)
            } else {
                decide(node, now, &self.config.retention)
            };

            let target = match decision {
                RetentionDecision::Keep => continue,
                RetentionDecision::Suspend => NodeState::Suspending,
                RetentionDecision::Destroy => NodeState::Destroying,
            };

            info!(
                node_id = %node_id,
                decision = ?decision,
                forced = node.reclaim_requested,
                "Reclaiming node"
            );
            self.transition(&node_id, target, now);
        }
    }

    fn cleanup_failed(&mut self, now: DateTime<Utc>) {
        let failed: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state() == NodeState::Failed && !self.in_flight.contains_key(n.id()))
            .map(|n| n.id().clone())
            .collect();

        for node_id in failed {
            info!(node_id = %node_id, "Cleaning up failed node");
            if !self.transition(&node_id, NodeState::Destroying, now) {
                error!(node_id = %node_id, "Failed node could not enter cleanup");
            }
        }
    }

    /// Issue suspend/destroy calls for nodes that need one and are due.
    fn issue_reclaims(&mut self, now: DateTime<Utc>) {
        let due: Vec<(NodeId, Operation)> = self
            .nodes
            .values()
            .filter(|n| !n.reclaim_blocked && !self.in_flight.contains_key(n.id()))
            .filter(|n| {
                self.reclaim_retries
                    .get(n.id())
                    .map_or(true, |retry| retry.next_at <= now)
            })
            .filter_map(|n| match n.state() {
                NodeState::Suspending => Some((n.id().clone(), Operation::Suspend)),
                NodeState::Destroying => Some((n.id().clone(), Operation::Destroy)),
                _ => None,
            })
            .collect();

        for (node_id, operation) in due {
            self.spawn_reclaim(node_id, operation);
        }
    }

    // =========================================================================
    // Spawned calls
    // =========================================================================

    fn spawn_request(&mut self, labels: LabelSet) {
        *self.requests.entry(labels.clone()).or_insert(0) += 1;

        let gateway = self.gateway.clone();
        let tx = self.gateway_tx.clone();
        let timeout = self.config.provision_timeout;
        let spec = NodeSpec {
            labels: labels.clone(),
            image: self.config.node_image.clone(),
            size: self.config.node_size.clone(),
        };

        debug!(label_set = %labels, "Requesting node");

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, gateway.request_node(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::BackendUnavailable(format!(
                    "request_node timed out after {:?}",
                    timeout
                ))),
            };
            let _ = tx.send(GatewayOutcome::Provisioned { labels, result });
        });
    }

    fn spawn_resume(&mut self, node_id: NodeId) {
        self.in_flight.insert(node_id.clone(), Operation::Resume);

        let gateway = self.gateway.clone();
        let tx = self.gateway_tx.clone();
        let timeout = self.config.provision_timeout;

        info!(node_id = %node_id, "Resuming suspended node");

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, gateway.resume_node(&node_id)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::BackendUnavailable(format!(
                    "resume_node timed out after {:?}",
                    timeout
                ))),
            };
            let _ = tx.send(GatewayOutcome::Resumed { node_id, result });
        });
    }

    fn spawn_reclaim(&mut self, node_id: NodeId, operation: Operation) {
        self.in_flight.insert(node_id.clone(), operation);

        let gateway = self.gateway.clone();
        let tx = self.gateway_tx.clone();
        let timeout = self.config.reclaim_timeout;

        debug!(node_id = %node_id, operation = ?operation, "Issuing reclaim call");

        tokio::spawn(async move {
            let call = async {
                match operation {
                    Operation::Suspend => gateway.suspend_node(&node_id).await,
                    _ => gateway.destroy_node(&node_id).await,
                }
            };
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ReclaimError::BackendUnavailable(format!(
                    "reclaim call timed out after {:?}",
                    timeout
                ))),
            };
            let _ = tx.send(GatewayOutcome::Reclaimed {
                node_id,
                operation,
                result,
            });
        });
    }

    fn spawn_launch(&mut self, node_id: &NodeId) {
        if self.shutting_down {
            return;
        }
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };

        let target = LaunchTarget {
            node_id: node_id.clone(),
            endpoint: node.endpoint.clone(),
            handshake_token: node.handshake_token.clone(),
        };
        self.in_flight.insert(node_id.clone(), Operation::Launch);

        let launcher = self.launcher.clone();
        let tx = self.launch_tx.clone();
        self.launches
            .spawn(async move { launcher.run(target, tx).await });
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    fn handle_event(&mut self, event: Event, now: DateTime<Utc>) {
        match event {
            Event::Gateway(GatewayOutcome::Provisioned { labels, result }) => {
                self.on_provisioned(labels, result, now)
            }
            Event::Gateway(GatewayOutcome::Resumed { node_id, result }) => {
                self.on_resumed(node_id, result, now)
            }
            Event::Gateway(GatewayOutcome::Reclaimed {
                node_id,
                operation,
                result,
            }) => self.on_reclaimed(node_id, operation, result, now),
            Event::Launch(LaunchEvent::Running { node_id }) => self.on_running(node_id, now),
            Event::Launch(LaunchEvent::Finished { node_id, result }) => {
                self.in_flight.remove(&node_id);
                match result {
                    Ok(info) => self.on_launched(node_id, &info.agent_version, now),
                    Err(e) => self.fail_node(&node_id, e.to_string(), now),
                }
            }
        }
    }

    fn on_provisioned(
        &mut self,
        labels: LabelSet,
        result: Result<ProvisionedNode, ProvisionError>,
        now: DateTime<Utc>,
    ) {
        if let Some(count) = self.requests.get_mut(&labels) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.requests.remove(&labels);
            }
        }

        let provisioned = match result {
            Ok(provisioned) => provisioned,
            Err(e) => {
                if e.is_retryable() {
                    warn!(label_set = %labels, error = %e, "Provisioning failed, will retry next tick");
                } else {
                    error!(label_set = %labels, error = %e, "Provisioning rejected, demand marked unsatisfiable");
                }
                if let Some(entry) = self.demand.get_mut(&labels) {
                    entry.last_error = Some(e.to_string());
                    if !e.is_retryable() {
                        entry.unsatisfiable = Some(e.to_string());
                    }
                }
                return;
            }
        };

        if self.nodes.contains_key(&provisioned.id) {
            error!(node_id = %provisioned.id, "Backend returned an id already in the fleet");
            return;
        }

        let mut node = NodeHandle::new(
            provisioned.id.clone(),
            labels.clone(),
            self.config.stop_on_reclaim,
            now,
        );
        node.image = self.config.node_image.clone();
        node.size = self.config.node_size.clone();
        node.endpoint = provisioned.endpoint;
        node.handshake_token = provisioned.handshake_token;

        let node_id = provisioned.id;
        self.nodes.insert(node_id.clone(), node);

        if let Some(entry) = self.demand.get_mut(&labels) {
            entry.last_error = None;
        }

        info!(node_id = %node_id, label_set = %labels, "Node accepted by backend");

        if self.transition(&node_id, NodeState::Provisioning, now) {
            self.spawn_launch(&node_id);
        }
    }

    fn on_resumed(&mut self, node_id: NodeId, result: Result<(), ProvisionError>, now: DateTime<Utc>) {
        self.in_flight.remove(&node_id);

        match result {
            Ok(()) => {
                info!(node_id = %node_id, "Node resumed");
                self.spawn_launch(&node_id);
            }
            Err(e) if e.is_retryable() && !self.shutting_down => {
                warn!(node_id = %node_id, error = %e, "Resume failed, will retry next tick");
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.last_error = Some(e.to_string());
                }
                self.pending_resumes.push(node_id);
            }
            Err(e) => self.fail_node(&node_id, e.to_string(), now),
        }
    }

    fn on_reclaimed(
        &mut self,
        node_id: NodeId,
        operation: Operation,
        result: Result<(), ReclaimError>,
        now: DateTime<Utc>,
    ) {
        self.in_flight.remove(&node_id);

        match result {
            Ok(()) | Err(ReclaimError::NotFound(_)) => {
                self.reclaim_retries.remove(&node_id);
                match operation {
                    Operation::Suspend => {
                        if self.transition(&node_id, NodeState::Suspended, now) {
                            if let Some(node) = self.nodes.get_mut(&node_id) {
                                node.reclaim_requested = false;
                                node.last_error = None;
                            }
                            self.persist(&node_id);
                            info!(node_id = %node_id, "Node suspended");
                        }
                    }
                    _ => {
                        if self.transition(&node_id, NodeState::Destroyed, now) {
                            self.nodes.remove(&node_id);
                            self.forget(&node_id);
                            info!(node_id = %node_id, "Node destroyed");
                        }
                    }
                }
            }
            Err(e @ ReclaimError::BackendUnavailable(_)) => {
                let attempts = self
                    .reclaim_retries
                    .get(&node_id)
                    .map_or(0, |retry| retry.attempts);
                let delay = self.config.reclaim_backoff.delay(attempts);
                let next_at = now
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

                warn!(
                    node_id = %node_id,
                    error = %e,
                    attempt = attempts + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reclaim call failed, will retry"
                );

                self.reclaim_retries.insert(
                    node_id.clone(),
                    RetryState {
                        attempts: attempts + 1,
                        next_at,
                    },
                );
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.last_error = Some(e.to_string());
                }
            }
            Err(e @ ReclaimError::PermissionDenied(_)) => {
                error!(node_id = %node_id, error = %e, "Reclaim denied, waiting for operator");
                self.reclaim_retries.remove(&node_id);
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.reclaim_blocked = true;
                    node.last_error = Some(e.to_string());
                }
                self.persist(&node_id);
            }
        }
    }

    fn on_running(&mut self, node_id: NodeId, now: DateTime<Utc>) {
        match self.nodes.get(&node_id).map(|n| n.state()) {
            Some(NodeState::Provisioning) => {
                debug!(node_id = %node_id, "Node running, starting handshake");
                self.transition(&node_id, NodeState::Launching, now);
            }
            state => debug!(node_id = %node_id, state = ?state, "Ignoring stale running event"),
        }
    }

    fn on_launched(&mut self, node_id: NodeId, agent_version: &str, now: DateTime<Utc>) {
        match self.nodes.get(&node_id).map(|n| n.state()) {
            Some(NodeState::Launching) => {
                if self.transition(&node_id, NodeState::Idle, now) {
                    if let Some(node) = self.nodes.get_mut(&node_id) {
                        node.last_error = None;
                    }
                    self.persist(&node_id);
                    info!(node_id = %node_id, agent_version, "Node ready");
                }
            }
            state => debug!(node_id = %node_id, state = ?state, "Ignoring stale launch result"),
        }
    }

    /// Move a provisioning or launching node to Failed.
    fn fail_node(&mut self, node_id: &NodeId, reason: String, now: DateTime<Utc>) {
        let Some(state) = self.nodes.get(node_id).map(|n| n.state()) else {
            return;
        };
        if !matches!(state, NodeState::Provisioning | NodeState::Launching) {
            debug!(node_id = %node_id, state = %state, "Ignoring failure for settled node");
            return;
        }

        warn!(node_id = %node_id, state = %state, reason = %reason, "Node failed");
        if self.transition(node_id, NodeState::Failed, now) {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.last_error = Some(reason);
            }
            self.persist(node_id);
        }
    }

    /// Apply a transition and checkpoint it.
    ///
    /// An invalid transition force-fails the node so cleanup can proceed.
    fn transition(&mut self, node_id: &NodeId, to: NodeState, now: DateTime<Utc>) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };

        let from = node.state();
        let ok = match node.transition_at(to, now) {
            Ok(()) => {
                debug!(node_id = %node_id, from = %from, to = %to, "Node transition");
                true
            }
            Err(e) => {
                error!(node_id = %node_id, error = %e, "Invalid transition, failing node");
                node.force_fail(e.to_string());
                false
            }
        };

        self.persist(node_id);
        ok
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    pub fn handle_command(&mut self, cmd: Command) {
        let now = Utc::now();
        match cmd {
            Command::RequestCapacity {
                labels,
                count,
                reply,
            } => {
                self.request_capacity(labels, count);
                let _ = reply.send(());
            }
            Command::ReportActivity { node_id, reply } => {
                let _ = reply.send(self.report_activity(&node_id, now));
            }
            Command::ForceReclaim { node_id, reply } => {
                let _ = reply.send(self.force_reclaim(&node_id));
            }
            Command::AssignWork { node_id, reply } => {
                let _ = reply.send(self.assign_work(&node_id, now));
            }
            Command::CompleteWork { node_id, reply } => {
                let _ = reply.send(self.complete_work(&node_id, now));
            }
            Command::ListNodes { reply } => {
                let _ = reply.send(self.list_nodes());
            }
            Command::ListDemand { reply } => {
                let _ = reply.send(self.list_demand());
            }
        }
    }

    /// Set the required capacity for a label-set.
    ///
    /// Clears any unsatisfiable mark, so a rejected spec is tried again.
    /// A count of zero removes the demand.
    pub fn request_capacity(&mut self, labels: LabelSet, count: u32) {
        info!(label_set = %labels, count, "Capacity requested");

        if count == 0 {
            self.demand.remove(&labels);
            return;
        }

        let entry = self.demand.entry(labels).or_default();
        entry.required = count;
        entry.unsatisfiable = None;
    }

    pub fn report_activity(&mut self, node_id: &NodeId, now: DateTime<Utc>) -> Result<(), SurfaceError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| SurfaceError::NotFound(node_id.clone()))?;

        node.touch(now);
        self.persist(node_id);
        Ok(())
    }

    /// Reclaim a node on the next tick regardless of idle time.
    ///
    /// Also unblocks a node whose reclaim was denied.
    pub fn force_reclaim(&mut self, node_id: &NodeId) -> Result<(), SurfaceError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| SurfaceError::NotFound(node_id.clone()))?;

        if node.state() == NodeState::Suspended {
            debug!(node_id = %node_id, "Node already suspended");
            return Ok(());
        }

        info!(node_id = %node_id, state = %node.state(), "Forced reclaim requested");
        node.reclaim_requested = true;
        node.reclaim_blocked = false;
        self.reclaim_retries.remove(node_id);
        self.persist(node_id);
        Ok(())
    }

    pub fn assign_work(&mut self, node_id: &NodeId, now: DateTime<Utc>) -> Result<(), SurfaceError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| SurfaceError::NotFound(node_id.clone()))?;

        if node.reclaim_requested {
            return Err(SurfaceError::ReclaimPending(node_id.clone()));
        }
        if node.state() != NodeState::Idle || self.in_flight.contains_key(node_id) {
            return Err(SurfaceError::InvalidState {
                node_id: node_id.clone(),
                state: node.state(),
            });
        }

        node.transition_at(NodeState::Busy, now)?;
        self.persist(node_id);
        Ok(())
    }

    pub fn complete_work(&mut self, node_id: &NodeId, now: DateTime<Utc>) -> Result<(), SurfaceError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| SurfaceError::NotFound(node_id.clone()))?;

        if node.state() != NodeState::Busy {
            return Err(SurfaceError::InvalidState {
                node_id: node_id.clone(),
                state: node.state(),
            });
        }

        node.transition_at(NodeState::Idle, now)?;
        self.persist(node_id);
        Ok(())
    }

    pub fn list_nodes(&self) -> Vec<NodeSnapshot> {
        self.nodes.values().map(NodeHandle::snapshot).collect()
    }

    pub fn list_demand(&self) -> Vec<DemandSnapshot> {
        self.demand
            .iter()
            .map(|(labels, entry)| DemandSnapshot {
                labels: labels.clone(),
                required: entry.required,
                supplied: self.supplied(labels),
                queued: entry.queued,
                outstanding: self.requests.get(labels).copied().unwrap_or(0),
                unsatisfiable: entry.unsatisfiable.clone(),
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    // =========================================================================
    // Checkpoint and recovery
    // =========================================================================

    fn persist(&self, node_id: &NodeId) {
        let (Some(store), Some(node)) = (&self.store, self.nodes.get(node_id)) else {
            return;
        };
        if let Err(e) = store.upsert_node(&NodeRecord::from_handle(node)) {
            error!(node_id = %node_id, error = %e, "Failed to checkpoint node");
        }
    }

    fn forget(&self, node_id: &NodeId) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete_node(node_id) {
            error!(node_id = %node_id, error = %e, "Failed to remove node from checkpoint");
        }
    }

    /// Rebuild the node set from the checkpoint, reconciling each record
    /// against live backend status.
    pub async fn recover(&mut self) -> Result<RecoveryReport, StateStoreError> {
        let records = match &self.store {
            Some(store) => store.list_nodes()?,
            None => return Ok(RecoveryReport::default()),
        };

        let mut report = RecoveryReport::default();

        for record in records {
            let lookup = match tokio::time::timeout(
                self.config.reclaim_timeout,
                self.gateway.poll_status(&record.id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LookupError::BackendUnavailable("status lookup timed out".to_string())),
            };

            let Some(state) = recovered_state(record.state, &lookup) else {
                info!(
                    node_id = %record.id,
                    recorded = %record.state,
                    "Node gone from backend, dropping record"
                );
                if let Some(store) = &self.store {
                    store.delete_node(&record.id)?;
                }
                report.dropped += 1;
                continue;
            };

            if let Err(e) = &lookup {
                warn!(node_id = %record.id, error = %e, "Status lookup failed during recovery");
            }

            info!(
                node_id = %record.id,
                recorded = %record.state,
                restored = %state,
                "Restored node"
            );

            let node_id = record.id.clone();
            let handle = record.into_handle(state);
            if let Some(store) = &self.store {
                store.upsert_node(&NodeRecord::from_handle(&handle))?;
            }
            self.nodes.insert(node_id.clone(), handle);
            report.restored += 1;

            if state == NodeState::Provisioning {
                self.spawn_launch(&node_id);
                report.relaunched += 1;
            }
        }

        info!(
            restored = report.restored,
            relaunched = report.relaunched,
            dropped = report.dropped,
            "Recovery complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop launching and reclaim every node, bounded by `grace`.
    ///
    /// Idle and busy nodes are reclaimed per their stop-on-reclaim flag;
    /// nodes still coming up are failed and destroyed. Suspended nodes
    /// count as reclaimed.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        self.shutting_down = true;
        self.launches.abort_all();
        self.in_flight.retain(|_, op| *op != Operation::Launch);
        self.pending_resumes.clear();

        let initial = self.nodes.len();
        info!(nodes = initial, grace_secs = grace.as_secs(), "Reclaiming fleet");

        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let now = Utc::now();
            self.drain_events(now);
            self.prepare_shutdown(now);
            self.issue_reclaims(now);

            if self.shutdown_complete() {
                break;
            }

            // Wake for the next event, the next retry, or the deadline
            let wake = self
                .reclaim_retries
                .values()
                .map(|retry| retry.next_at)
                .min()
                .and_then(|at| (at - now).to_std().ok())
                .map(|d| tokio::time::Instant::now() + d)
                .unwrap_or(deadline)
                .min(deadline);

            match tokio::time::timeout_at(
                wake,
                Self::recv_event(&mut self.gateway_rx, &mut self.launch_rx),
            )
            .await
            {
                Ok(Some(event)) => self.handle_event(event, Utc::now()),
                Ok(None) => break,
                Err(_) if tokio::time::Instant::now() >= deadline => break,
                Err(_) => {}
            }
        }

        let abandoned: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state() != NodeState::Suspended)
            .map(|n| n.id().clone())
            .collect();
        let reclaimed = initial.saturating_sub(abandoned.len());

        for node_id in &abandoned {
            let state = self.nodes.get(node_id).map(|n| n.state());
            warn!(node_id = %node_id, state = ?state, "Abandoning node not reclaimed in time");
        }

        info!(reclaimed, abandoned = abandoned.len(), "Fleet reclaim finished");
        ShutdownReport {
            reclaimed,
            abandoned,
        }
    }

    fn prepare_shutdown(&mut self, now: DateTime<Utc>) {
        let pending: Vec<(NodeId, NodeState)> = self
            .nodes
            .values()
            .filter(|n| !self.in_flight.contains_key(n.id()))
            .map(|n| (n.id().clone(), n.state()))
            .collect();

        for (node_id, state) in pending {
            match state {
                NodeState::Busy => {
                    if self.transition(&node_id, NodeState::Idle, now) {
                        self.reclaim_on_shutdown(&node_id, now);
                    }
                }
                NodeState::Idle => self.reclaim_on_shutdown(&node_id, now),
                NodeState::Requested | NodeState::Provisioning | NodeState::Launching => {
                    self.fail_node(&node_id, "controller shutting down".to_string(), now);
                    self.transition(&node_id, NodeState::Destroying, now);
                }
                NodeState::Failed => {
                    self.transition(&node_id, NodeState::Destroying, now);
                }
                NodeState::Suspending
                | NodeState::Suspended
                | NodeState::Destroying
                | NodeState::Destroyed => {}
            }
        }
    }

    fn reclaim_on_shutdown(&mut self, node_id: &NodeId, now: DateTime<Utc>) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        let target = match decide_forced(node) {
            RetentionDecision::Suspend => NodeState::Suspending,
            _ => NodeState::Destroying,
        };
        self.transition(node_id, target, now);
    }

    fn shutdown_complete(&self) -> bool {
        if self.outstanding_requests() > 0 || !self.in_flight.is_empty() {
            return false;
        }
        self.nodes
            .values()
            .all(|n| n.state() == NodeState::Suspended || n.reclaim_blocked)
    }
}

/// State a checkpointed node resumes in, or `None` when the record should
/// be dropped because the backend no longer has the node.
fn recovered_state(
    recorded: NodeState,
    lookup: &Result<crate::gateway::StatusReport, LookupError>,
) -> Option<NodeState> {
    let status = match lookup {
        Ok(report) => report.status,
        Err(LookupError::NotFound(_)) => return None,
        Err(LookupError::BackendUnavailable(_)) => BackendStatus::Unknown,
    };

    if status == BackendStatus::Terminated {
        return None;
    }

    let state = match (recorded, status) {
        (NodeState::Failed, _) => NodeState::Failed,
        (NodeState::Destroying | NodeState::Destroyed, _) => NodeState::Destroying,
        (NodeState::Suspending, BackendStatus::Suspended) => NodeState::Suspended,
        (NodeState::Suspending, _) => NodeState::Suspending,
        (_, BackendStatus::Suspended) => NodeState::Suspended,
        (_, BackendStatus::Running | BackendStatus::Pending | BackendStatus::Unknown) => {
            NodeState::Provisioning
        }
        (_, BackendStatus::Terminated) => return None,
    };

    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use async_trait::async_trait;

    use crate::error::LaunchError;
    use crate::gateway::{MockGateway, MockNode, StatusReport};
    use crate::launch::AgentInfo;

    struct AcceptingAgent;

    #[async_trait]
    impl AgentConnector for AcceptingAgent {
        async fn handshake(
            &self,
            _node_id: &NodeId,
            _endpoint: &str,
            _token: Option<&str>,
        ) -> Result<AgentInfo, LaunchError> {
            Ok(AgentInfo {
                agent_version: "test-agent".to_string(),
            })
        }
    }

    fn linux() -> LabelSet {
        "linux".parse().unwrap()
    }

    /// Register `id` with the mock backend and adopt it in `state`.
    fn adopt(
        controller: &mut FleetController,
        gateway: &MockGateway,
        id: &str,
        state: NodeState,
        status: BackendStatus,
    ) -> NodeId {
        let id = NodeId::new(id);
        gateway.insert_node(
            id.clone(),
            MockNode {
                spec: NodeSpec {
                    labels: linux(),
                    image: "ubuntu-22.04".to_string(),
                    size: "small".to_string(),
                },
                status,
                endpoint: Some(format!("{}.mock.internal:7100", id)),
                pending_polls: 0,
            },
        );

        let now = Utc::now();
        let handle = NodeHandle::restore(id.clone(), linux(), state, false, now, now);
        controller.nodes.insert(id.clone(), handle);
        controller.persist(&id);
        id
    }

    #[tokio::test]
    async fn test_invalid_transition_fails_node_and_cleans_up() {
        let gateway = Arc::new(MockGateway::new());
        let mut controller =
            FleetController::new(gateway.clone(), Arc::new(AcceptingAgent), ControllerConfig::default())
                .with_store(StateStore::open_in_memory().unwrap());
        let id = adopt(&mut controller, &gateway, "node-a", NodeState::Idle, BackendStatus::Running);

        // Idle has no edge back to Requested
        assert!(!controller.transition(&id, NodeState::Requested, Utc::now()));

        let node = controller.node(&id).unwrap();
        assert_eq!(node.state(), NodeState::Failed);
        assert!(node.last_error.as_deref().unwrap().contains("idle -> requested"));
        let store = controller.store.as_ref().unwrap();
        assert_eq!(store.get_node(&id).unwrap().unwrap().state, NodeState::Failed);

        controller.tick_at(Utc::now());
        assert_eq!(controller.node(&id).unwrap().state(), NodeState::Destroying);
        let store = controller.store.as_ref().unwrap();
        assert_eq!(store.get_node(&id).unwrap().unwrap().state, NodeState::Destroying);

        assert!(controller.settle(Duration::from_secs(5)).await);
        assert!(controller.node(&id).is_none());
        assert_eq!(gateway.destroy_calls(&id), 1);
        assert_eq!(gateway.status_of(&id), Some(BackendStatus::Terminated));
        let store = controller.store.as_ref().unwrap();
        assert!(store.get_node(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_resume_waits_for_room_under_cap() {
        let gateway = Arc::new(MockGateway::new());
        let config = ControllerConfig {
            strategy: ProvisioningStrategy { max_concurrent: 1 },
            ..ControllerConfig::default()
        };
        let mut controller = FleetController::new(gateway.clone(), Arc::new(AcceptingAgent), config);
        let id = adopt(
            &mut controller,
            &gateway,
            "node-b",
            NodeState::Provisioning,
            BackendStatus::Suspended,
        );
        controller.pending_resumes.push(id.clone());

        // A request_node call already fills the cap
        controller.requests.insert(linux(), 1);
        controller.provision(Utc::now());

        assert!(!controller.in_flight.contains_key(&id));
        assert_eq!(controller.pending_resumes, vec![id.clone()]);
        assert_eq!(controller.outstanding_provisioning(), 1);

        controller.requests.clear();
        controller.provision(Utc::now());

        assert_eq!(controller.in_flight.get(&id), Some(&Operation::Resume));
        assert!(controller.pending_resumes.is_empty());
        assert_eq!(controller.outstanding_provisioning(), 1);
    }

    fn status(status: BackendStatus) -> Result<StatusReport, LookupError> {
        Ok(StatusReport {
            status,
            endpoint: None,
        })
    }

    #[rstest]
    #[case(NodeState::Idle, status(BackendStatus::Running), Some(NodeState::Provisioning))]
    #[case(NodeState::Busy, status(BackendStatus::Pending), Some(NodeState::Provisioning))]
    #[case(NodeState::Launching, status(BackendStatus::Unknown), Some(NodeState::Provisioning))]
    #[case(NodeState::Suspended, status(BackendStatus::Suspended), Some(NodeState::Suspended))]
    #[case(NodeState::Suspending, status(BackendStatus::Suspended), Some(NodeState::Suspended))]
    #[case(NodeState::Suspending, status(BackendStatus::Running), Some(NodeState::Suspending))]
    #[case(NodeState::Idle, status(BackendStatus::Suspended), Some(NodeState::Suspended))]
    #[case(NodeState::Destroying, status(BackendStatus::Running), Some(NodeState::Destroying))]
    #[case(NodeState::Failed, status(BackendStatus::Running), Some(NodeState::Failed))]
    #[case(NodeState::Idle, status(BackendStatus::Terminated), None)]
    #[case(NodeState::Destroying, Err(LookupError::NotFound("gone".into())), None)]
    #[case(NodeState::Idle, Err(LookupError::BackendUnavailable("down".into())), Some(NodeState::Provisioning))]
    fn test_recovered_state(
        #[case] recorded: NodeState,
        #[case] lookup: Result<StatusReport, LookupError>,
        #[case] expected: Option<NodeState>,
    ) {
        assert_eq!(recovered_state(recorded, &lookup), expected);
    }

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(10));
        assert_eq!(config.strategy.max_concurrent, 4);
        assert_eq!(config.retention.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.provision_timeout, Duration::from_secs(120));
        assert_eq!(config.reclaim_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(60));
        assert_eq!(config.launch.max_attempts, 10);
        assert!(!config.stop_on_reclaim);
    }
}
