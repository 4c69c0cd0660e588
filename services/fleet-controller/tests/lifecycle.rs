//! Integration tests for the controller lifecycle.
//!
//! Drives `FleetController` tick by tick against `MockGateway` and a
//! scripted agent:
//! 1. Demand is provisioned up to the concurrency cap
//! 2. Nodes launch, go idle and are reclaimed by retention
//! 3. Failures are retried, failed or blocked as their kind dictates

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_controller::gateway::{BackendStatus, MockGateway, ProvisioningGateway};
use fleet_controller::launch::{AgentConnector, AgentInfo, LaunchConfig};
use fleet_controller::state::StateStore;
use fleet_controller::surface::COMMAND_BUFFER;
use fleet_controller::{
    ControllerConfig, FleetController, FleetHandle, LaunchError, LookupError, NodeId,
    NodeState, ProvisionError, ReclaimError, SurfaceError,
};
use fleet_reconcile::{BackoffPolicy, LabelSet, ProvisioningStrategy, RetentionPolicy};

const SETTLE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum AgentMode {
    Accept,
    Unreachable,
    Reject,
}

/// Agent stand-in with a fixed answer.
struct ScriptedAgent {
    mode: AgentMode,
    calls: AtomicU32,
}

impl ScriptedAgent {
    fn new(mode: AgentMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for ScriptedAgent {
    async fn handshake(
        &self,
        _node_id: &NodeId,
        _endpoint: &str,
        _token: Option<&str>,
    ) -> Result<AgentInfo, LaunchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            AgentMode::Accept => Ok(AgentInfo {
                agent_version: "test-agent".to_string(),
            }),
            AgentMode::Unreachable => Err(LaunchError::Unreachable("connection refused".to_string())),
            AgentMode::Reject => Err(LaunchError::HandshakeRejected("bad token".to_string())),
        }
    }
}

fn test_config(stop_on_reclaim: bool) -> ControllerConfig {
    ControllerConfig {
        strategy: ProvisioningStrategy { max_concurrent: 4 },
        retention: RetentionPolicy {
            idle_timeout: Duration::from_secs(600),
        },
        stop_on_reclaim,
        node_image: "ubuntu-22.04".to_string(),
        node_size: "small".to_string(),
        launch: LaunchConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(4),
                jitter: 0.0,
            },
            max_attempts: 10,
            status_timeout: Duration::from_secs(1),
        },
        ..ControllerConfig::default()
    }
}

fn labels(s: &str) -> LabelSet {
    s.parse().unwrap()
}

fn controller(
    gateway: &Arc<MockGateway>,
    agent: &Arc<ScriptedAgent>,
    stop_on_reclaim: bool,
) -> FleetController {
    FleetController::new(gateway.clone(), agent.clone(), test_config(stop_on_reclaim))
}

/// Tick once and wait for every spawned call to report back.
async fn tick_and_settle(controller: &mut FleetController) {
    controller.tick();
    assert!(controller.settle(SETTLE).await, "controller did not settle");
}

fn ids_in(controller: &FleetController, state: NodeState) -> Vec<NodeId> {
    controller
        .list_nodes()
        .into_iter()
        .filter(|n| n.state == state)
        .map(|n| n.id)
        .collect()
}

/// Provision a single idle node and return its id.
async fn idle_node(controller: &mut FleetController, demand: &str) -> NodeId {
    controller.request_capacity(labels(demand), 1);
    tick_and_settle(controller).await;
    let idle = ids_in(controller, NodeState::Idle);
    assert_eq!(idle.len(), 1, "expected one idle node: {:?}", controller.list_nodes());
    idle[0].clone()
}

#[tokio::test]
async fn test_demand_is_capped_per_tick() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    controller.request_capacity(labels("linux"), 10);
    controller.tick();

    // A second tick while the first calls are outstanding issues nothing
    controller.tick();
    assert!(controller.settle(SETTLE).await);
    assert_eq!(gateway.request_calls(), 4);
    assert_eq!(ids_in(&controller, NodeState::Idle).len(), 4);

    let demand = controller.list_demand();
    assert_eq!(demand.len(), 1);
    assert_eq!(demand[0].required, 10);
    assert_eq!(demand[0].supplied, 4);

    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.request_calls(), 8);

    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.request_calls(), 10);

    // Demand met: nothing more is requested
    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.request_calls(), 10);
    assert_eq!(controller.list_demand()[0].queued, 0);
    assert_eq!(ids_in(&controller, NodeState::Idle).len(), 10);
}

#[tokio::test]
async fn test_queued_demand_is_recorded() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_latency(Duration::from_millis(50));
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    controller.request_capacity(labels("linux"), 6);
    controller.tick();

    let demand = controller.list_demand();
    assert_eq!(demand[0].outstanding, 4);
    assert_eq!(demand[0].queued, 2);
    assert_eq!(demand[0].supplied, 4);

    assert!(controller.settle(SETTLE).await);
}

#[tokio::test]
async fn test_existing_supply_counts_toward_demand() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    // A node with a superset of labels serves the narrower demand
    controller.request_capacity(labels("gpu,linux"), 1);
    tick_and_settle(&mut controller).await;
    controller.request_capacity(labels("gpu,linux"), 0);
    controller.request_capacity(labels("linux"), 3);
    tick_and_settle(&mut controller).await;

    assert_eq!(gateway.request_calls(), 3);
    assert_eq!(controller.list_nodes().len(), 3);
}

#[tokio::test]
async fn test_quota_exceeded_is_retried_next_tick() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    gateway.push_request_error(ProvisionError::QuotaExceeded("cores".to_string()));
    controller.request_capacity(labels("linux"), 1);
    tick_and_settle(&mut controller).await;

    // The failed request never produced a node
    assert!(controller.list_nodes().is_empty());
    let demand = controller.list_demand();
    assert_eq!(demand[0].supplied, 0);
    assert!(demand[0].unsatisfiable.is_none());
    assert!(demand[0].last_error.as_deref().unwrap().contains("quota"));

    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.request_calls(), 2);
    assert_eq!(ids_in(&controller, NodeState::Idle).len(), 1);
    assert!(controller.list_demand()[0].last_error.is_none());
}

#[tokio::test]
async fn test_invalid_spec_marks_demand_unsatisfiable() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    gateway.set_request_error(Some(ProvisionError::InvalidSpec("no such image".to_string())));
    controller.request_capacity(labels("linux"), 2);
    tick_and_settle(&mut controller).await;
    tick_and_settle(&mut controller).await;

    // Only the first tick's calls were made
    assert_eq!(gateway.request_calls(), 2);
    assert!(controller.list_demand()[0].unsatisfiable.is_some());

    // A new request for the label-set tries again
    gateway.set_request_error(None);
    controller.request_capacity(labels("linux"), 2);
    tick_and_settle(&mut controller).await;
    assert_eq!(ids_in(&controller, NodeState::Idle).len(), 2);
}

#[tokio::test]
async fn test_request_timeout_is_retried_next_tick() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut config = test_config(false);
    config.provision_timeout = Duration::from_millis(50);
    let mut controller = FleetController::new(gateway.clone(), agent.clone(), config);

    gateway.set_latency(Duration::from_millis(300));
    controller.request_capacity(labels("linux"), 1);
    tick_and_settle(&mut controller).await;

    assert!(controller.list_nodes().is_empty());
    let demand = controller.list_demand();
    assert_eq!(demand[0].supplied, 0);
    assert_eq!(demand[0].outstanding, 0);
    assert!(demand[0].unsatisfiable.is_none());
    let err = demand[0].last_error.clone().unwrap();
    assert!(err.contains("timed out after 50ms"), "{err}");

    gateway.set_latency(Duration::ZERO);
    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.request_calls(), 2);
    assert_eq!(ids_in(&controller, NodeState::Idle).len(), 1);
}

#[tokio::test]
async fn test_destroy_timeout_schedules_reclaim_retry() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut config = test_config(false);
    config.reclaim_timeout = Duration::from_millis(50);
    let mut controller = FleetController::new(gateway.clone(), agent.clone(), config);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    gateway.set_latency(Duration::from_millis(300));
    controller.force_reclaim(&node_id).unwrap();
    tick_and_settle(&mut controller).await;

    let node = controller.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Destroying);
    let err = node.last_error.clone().unwrap();
    assert!(err.contains("timed out after 50ms"), "{err}");
    // The abandoned call never reached the backend
    assert_eq!(gateway.destroy_calls(&node_id), 0);
    assert_eq!(gateway.status_of(&node_id), Some(BackendStatus::Running));

    // The retry waits for its backoff
    gateway.set_latency(Duration::ZERO);
    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.destroy_calls(&node_id), 0);
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Destroying);

    controller.tick_at(Utc::now() + chrono::Duration::seconds(600));
    assert!(controller.settle(SETTLE).await);
    assert_eq!(gateway.destroy_calls(&node_id), 1);
    assert!(controller.node(&node_id).is_none());
}

#[tokio::test]
async fn test_launch_exhaustion_fails_and_destroys_once() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Unreachable);
    let mut controller = controller(&gateway, &agent, false);

    controller.request_capacity(labels("linux"), 1);
    tick_and_settle(&mut controller).await;

    assert_eq!(agent.calls(), 10);
    let failed = ids_in(&controller, NodeState::Failed);
    assert_eq!(failed.len(), 1);
    let node_id = failed[0].clone();
    let snapshot = controller.node(&node_id).unwrap().snapshot();
    assert!(snapshot.last_error.unwrap().contains("10 attempts"));

    // Stop asking for capacity so cleanup is the only activity
    controller.request_capacity(labels("linux"), 0);
    controller.tick();
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Destroying);
    assert!(controller.settle(SETTLE).await);

    assert!(controller.node(&node_id).is_none());
    assert_eq!(gateway.destroy_calls(&node_id), 1);
    assert_eq!(gateway.status_of(&node_id), Some(BackendStatus::Terminated));

    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.destroy_calls(&node_id), 1);
}

#[tokio::test]
async fn test_rejected_handshake_is_not_retried() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Reject);
    let mut controller = controller(&gateway, &agent, false);

    controller.request_capacity(labels("linux"), 1);
    tick_and_settle(&mut controller).await;

    assert_eq!(agent.calls(), 1);
    assert_eq!(ids_in(&controller, NodeState::Failed).len(), 1);
}

#[tokio::test]
async fn test_idle_timeout_suspends_when_stop_on_reclaim() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, true);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    // Not idle long enough
    controller.tick_at(Utc::now() + chrono::Duration::seconds(599));
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Idle);

    controller.tick_at(Utc::now() + chrono::Duration::seconds(601));
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Suspending);
    assert!(controller.settle(SETTLE).await);

    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Suspended);
    assert_eq!(gateway.status_of(&node_id), Some(BackendStatus::Suspended));
    assert_eq!(gateway.suspend_calls(&node_id), 1);
    assert_eq!(gateway.destroy_calls(&node_id), 0);
}

#[tokio::test]
async fn test_idle_timeout_destroys_without_stop_on_reclaim() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    controller.tick_at(Utc::now() + chrono::Duration::seconds(601));
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Destroying);
    assert!(controller.settle(SETTLE).await);

    assert!(controller.node(&node_id).is_none());
    assert_eq!(gateway.status_of(&node_id), Some(BackendStatus::Terminated));
    assert_eq!(gateway.live_node_count(), 0);
}

#[tokio::test]
async fn test_activity_postpones_reclaim() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    let now = Utc::now();
    controller
        .report_activity(&node_id, now + chrono::Duration::seconds(300))
        .unwrap();
    controller.tick_at(now + chrono::Duration::seconds(700));
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Idle);

    let err = controller
        .report_activity(&NodeId::new("missing"), now)
        .unwrap_err();
    assert_eq!(err, SurfaceError::NotFound(NodeId::new("missing")));
}

#[tokio::test]
async fn test_suspended_node_is_resumed_before_requesting() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, true);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);
    controller.tick_at(Utc::now() + chrono::Duration::seconds(601));
    assert!(controller.settle(SETTLE).await);
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Suspended);

    controller.request_capacity(labels("linux"), 1);
    controller.tick();
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Provisioning);
    assert!(controller.settle(SETTLE).await);

    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Idle);
    assert_eq!(gateway.resume_calls(), 1);
    assert_eq!(gateway.request_calls(), 1);
}

#[tokio::test]
async fn test_work_assignment() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    let now = Utc::now();

    controller.assign_work(&node_id, now).unwrap();
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Busy);

    // Busy nodes are never reclaimed by the idle timeout
    controller.request_capacity(labels("linux"), 0);
    controller.tick_at(now + chrono::Duration::seconds(3600));
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Busy);

    let err = controller.assign_work(&node_id, now).unwrap_err();
    assert!(matches!(err, SurfaceError::InvalidState { state: NodeState::Busy, .. }));

    controller.complete_work(&node_id, now).unwrap();
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Idle);
    assert!(controller.complete_work(&node_id, now).is_err());
}

#[tokio::test]
async fn test_force_reclaim_releases_busy_node() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);
    controller.assign_work(&node_id, Utc::now()).unwrap();

    controller.force_reclaim(&node_id).unwrap();
    controller.complete_work(&node_id, Utc::now()).unwrap();
    let err = controller.assign_work(&node_id, Utc::now()).unwrap_err();
    assert_eq!(err, SurfaceError::ReclaimPending(node_id.clone()));

    controller.tick();
    assert_eq!(controller.node(&node_id).unwrap().state(), NodeState::Destroying);
    assert!(controller.settle(SETTLE).await);
    assert!(controller.node(&node_id).is_none());
}

#[tokio::test]
async fn test_force_reclaim_of_busy_node_on_next_tick() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, true);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);
    controller.assign_work(&node_id, Utc::now()).unwrap();
    controller.force_reclaim(&node_id).unwrap();

    tick_and_settle(&mut controller).await;
    let node = controller.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Suspended);
    assert!(!node.reclaim_requested);
}

#[tokio::test]
async fn test_reclaim_is_serialised_per_node() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    gateway.set_latency(Duration::from_millis(100));
    controller.force_reclaim(&node_id).unwrap();
    controller.tick();
    controller.tick();
    controller.tick();
    assert!(controller.settle(SETTLE).await);

    assert_eq!(gateway.destroy_calls(&node_id), 1);
}

#[tokio::test]
async fn test_transient_reclaim_failure_is_retried_with_backoff() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    gateway.set_reclaim_error(Some(ReclaimError::BackendUnavailable("503".to_string())));
    controller.force_reclaim(&node_id).unwrap();
    tick_and_settle(&mut controller).await;

    let node = controller.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Destroying);
    assert!(node.last_error.is_some());
    assert_eq!(gateway.destroy_calls(&node_id), 1);

    // Backoff has not elapsed
    tick_and_settle(&mut controller).await;
    assert_eq!(gateway.destroy_calls(&node_id), 1);

    gateway.set_reclaim_error(None);
    controller.tick_at(Utc::now() + chrono::Duration::seconds(600));
    assert!(controller.settle(SETTLE).await);

    assert_eq!(gateway.destroy_calls(&node_id), 2);
    assert!(controller.node(&node_id).is_none());
}

#[tokio::test]
async fn test_permission_denied_blocks_until_forced() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, true);

    let node_id = idle_node(&mut controller, "linux").await;
    controller.request_capacity(labels("linux"), 0);

    gateway.set_reclaim_error(Some(ReclaimError::PermissionDenied("iam".to_string())));
    controller.tick_at(Utc::now() + chrono::Duration::seconds(601));
    assert!(controller.settle(SETTLE).await);

    let node = controller.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Suspending);
    assert!(node.reclaim_blocked);

    controller.tick_at(Utc::now() + chrono::Duration::seconds(3600));
    assert!(controller.settle(SETTLE).await);
    assert_eq!(gateway.suspend_calls(&node_id), 1);

    gateway.set_reclaim_error(None);
    controller.force_reclaim(&node_id).unwrap();
    tick_and_settle(&mut controller).await;

    let node = controller.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Suspended);
    assert!(!node.reclaim_blocked);
    assert_eq!(gateway.suspend_calls(&node_id), 2);
}

#[tokio::test]
async fn test_shutdown_suspends_idle_and_busy_nodes() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, true);

    controller.request_capacity(labels("linux"), 2);
    tick_and_settle(&mut controller).await;
    let idle = ids_in(&controller, NodeState::Idle);
    assert_eq!(idle.len(), 2);
    controller.assign_work(&idle[0], Utc::now()).unwrap();

    let report = controller.shutdown(Duration::from_secs(5)).await;

    assert_eq!(report.reclaimed, 2);
    assert!(report.abandoned.is_empty());
    for id in &idle {
        assert_eq!(controller.node(id).unwrap().state(), NodeState::Suspended);
        assert_eq!(gateway.status_of(id), Some(BackendStatus::Suspended));
    }
}

#[tokio::test]
async fn test_shutdown_destroys_launching_nodes() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Unreachable);
    let mut config = test_config(true);
    config.launch.backoff = BackoffPolicy {
        base: Duration::from_secs(30),
        max: Duration::from_secs(30),
        jitter: 0.0,
    };
    let mut controller = FleetController::new(gateway.clone(), agent.clone(), config);

    controller.request_capacity(labels("linux"), 1);
    controller.tick();
    // Let the request land so the next tick starts the launch
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.tick();

    let report = controller.shutdown(Duration::from_secs(5)).await;

    assert_eq!(report.reclaimed, 1);
    assert!(report.abandoned.is_empty());
    assert!(controller.list_nodes().is_empty());
    assert_eq!(gateway.live_node_count(), 0);
}

#[tokio::test]
async fn test_shutdown_abandons_unreclaimable_nodes() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut controller = controller(&gateway, &agent, false);

    let node_id = idle_node(&mut controller, "linux").await;
    gateway.set_reclaim_error(Some(ReclaimError::PermissionDenied("iam".to_string())));

    let report = controller.shutdown(Duration::from_secs(2)).await;

    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.abandoned, vec![node_id]);
}

#[tokio::test]
async fn test_restart_reconciles_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);

    let (kept, gone) = {
        let mut first = controller(&gateway, &agent, false)
            .with_store(StateStore::open(&db_path).unwrap());
        first.request_capacity(labels("linux"), 2);
        tick_and_settle(&mut first).await;
        let idle = ids_in(&first, NodeState::Idle);
        assert_eq!(idle.len(), 2);
        (idle[0].clone(), idle[1].clone())
    };

    // One node vanished while the controller was down
    gateway.destroy_node(&gone).await.unwrap();

    let mut second =
        controller(&gateway, &agent, false).with_store(StateStore::open(&db_path).unwrap());
    let report = second.recover().await.unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.relaunched, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(second.node(&kept).unwrap().state(), NodeState::Provisioning);
    assert!(second.node(&gone).is_none());

    assert!(second.settle(SETTLE).await);
    let node = second.node(&kept).unwrap();
    assert_eq!(node.state(), NodeState::Idle);
    assert_eq!(node.image, "ubuntu-22.04");

    let store = StateStore::open(&db_path).unwrap();
    let records = store.list_nodes().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, kept);
}

#[tokio::test]
async fn test_restart_keeps_suspended_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);

    let node_id = {
        let mut first =
            controller(&gateway, &agent, true).with_store(StateStore::open(&db_path).unwrap());
        let node_id = idle_node(&mut first, "linux").await;
        first.request_capacity(labels("linux"), 0);
        first.tick_at(Utc::now() + chrono::Duration::seconds(601));
        assert!(first.settle(SETTLE).await);
        node_id
    };

    let mut second =
        controller(&gateway, &agent, true).with_store(StateStore::open(&db_path).unwrap());
    let report = second.recover().await.unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.relaunched, 0);
    assert_eq!(second.node(&node_id).unwrap().state(), NodeState::Suspended);
}

#[tokio::test]
async fn test_restart_keeps_nodes_when_status_lookup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);

    let node_id = {
        let mut first =
            controller(&gateway, &agent, false).with_store(StateStore::open(&db_path).unwrap());
        idle_node(&mut first, "linux,gpu").await
    };

    // An unreachable backend cannot prove the node is gone
    gateway.set_lookup_error(Some(LookupError::BackendUnavailable("503".to_string())));
    let mut second =
        controller(&gateway, &agent, false).with_store(StateStore::open(&db_path).unwrap());
    let report = second.recover().await.unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.relaunched, 1);
    assert_eq!(report.dropped, 0);
    let node = second.node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Provisioning);
    assert!(node.label_set().contains("gpu"));
    assert!(!node.label_set().contains("windows"));

    gateway.set_lookup_error(None);
    assert!(second.settle(SETTLE).await);
    assert_eq!(second.node(&node_id).unwrap().state(), NodeState::Idle);
}

#[tokio::test]
async fn test_run_loop_serves_handle_commands() {
    let gateway = Arc::new(MockGateway::new());
    let agent = ScriptedAgent::new(AgentMode::Accept);
    let mut config = test_config(true);
    config.tick_interval = Duration::from_millis(20);
    let controller = FleetController::new(gateway.clone(), agent.clone(), config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (handle, commands) = FleetHandle::channel(COMMAND_BUFFER);
    let task = tokio::spawn(controller.run(shutdown_rx, commands));

    handle.request_capacity(labels("linux"), 2).await.unwrap();

    let deadline = tokio::time::Instant::now() + SETTLE;
    let idle = loop {
        let nodes = handle.list_nodes().await.unwrap();
        let idle: Vec<NodeId> = nodes
            .into_iter()
            .filter(|n| n.state == NodeState::Idle)
            .map(|n| n.id)
            .collect();
        if idle.len() == 2 {
            break idle;
        }
        assert!(tokio::time::Instant::now() < deadline, "fleet never became ready");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    handle.assign_work(idle[0].clone()).await.unwrap();
    assert_eq!(handle.get_node(&idle[0]).await.unwrap().state, NodeState::Busy);
    assert_eq!(
        handle.get_node(&NodeId::new("missing")).await.unwrap_err(),
        SurfaceError::NotFound(NodeId::new("missing"))
    );

    let demand = handle.list_demand().await.unwrap();
    assert_eq!(demand[0].supplied, 2);

    shutdown_tx.send(true).unwrap();
    let report = task.await.unwrap();
    assert_eq!(report.reclaimed, 2);
    assert!(report.abandoned.is_empty());

    // The loop is gone
    assert_eq!(handle.list_nodes().await.unwrap_err(), SurfaceError::Stopped);
}
