//! Launch coordination: bringing a provisioned node to "ready for work".
//!
//! Protocol flow:
//! 1. Poll the backend until the node reports running
//! 2. Controller connects to the agent endpoint over TCP
//! 3. Controller sends a hello message with the handshake token
//! 4. Agent answers with an ack (accepted or rejected)
//!
//! Messages are newline-delimited JSON. Every poll and every failed
//! handshake consumes one attempt; attempts are spaced with exponential
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::{BackoffPolicy, DEFAULT_LAUNCH_ATTEMPTS, DEFAULT_RECLAIM_TIMEOUT};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{LaunchError, LookupError};
use crate::gateway::{BackendStatus, ProvisioningGateway};
use crate::node::NodeId;

/// Current handshake protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Spacing between attempts.
    pub backoff: BackoffPolicy,

    /// Attempts before the launch is abandoned.
    pub max_attempts: u32,

    /// Timeout for each `poll_status` call.
    pub status_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_LAUNCH_ATTEMPTS,
            status_timeout: DEFAULT_RECLAIM_TIMEOUT,
        }
    }
}

/// What the coordinator needs to know about the node it launches.
#[derive(Debug, Clone)]
pub struct LaunchTarget {
    pub node_id: NodeId,
    pub endpoint: Option<String>,
    pub handshake_token: Option<String>,
}

/// Information the agent returns on a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_version: String,
}

/// Progress reported back to the controller.
#[derive(Debug)]
pub enum LaunchEvent {
    /// The backend reported the node running; the handshake starts now.
    Running { node_id: NodeId },

    /// The launch finished.
    Finished {
        node_id: NodeId,
        result: Result<AgentInfo, LaunchError>,
    },
}

/// Agent connection handshake.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Perform one handshake attempt against `endpoint`.
    ///
    /// Transient failures return `LaunchError::Unreachable`; an agent
    /// that refuses returns `LaunchError::HandshakeRejected`.
    async fn handshake(
        &self,
        node_id: &NodeId,
        endpoint: &str,
        token: Option<&str>,
    ) -> Result<AgentInfo, LaunchError>;
}

/// Brings provisioned nodes online.
///
/// Never touches controller state: results are sent as `LaunchEvent`s.
#[derive(Clone)]
pub struct LaunchCoordinator {
    gateway: Arc<dyn ProvisioningGateway>,
    connector: Arc<dyn AgentConnector>,
    config: LaunchConfig,
}

impl LaunchCoordinator {
    pub fn new(
        gateway: Arc<dyn ProvisioningGateway>,
        connector: Arc<dyn AgentConnector>,
        config: LaunchConfig,
    ) -> Self {
        Self {
            gateway,
            connector,
            config,
        }
    }

    /// Launch a node, reporting progress on `events`, and send the final result.
    pub async fn run(&self, target: LaunchTarget, events: mpsc::UnboundedSender<LaunchEvent>) {
        let node_id = target.node_id.clone();
        let result = self.launch(target, &events).await;
        let _ = events.send(LaunchEvent::Finished { node_id, result });
    }

    /// Launch a node and return the outcome.
    pub async fn launch(
        &self,
        target: LaunchTarget,
        events: &mpsc::UnboundedSender<LaunchEvent>,
    ) -> Result<AgentInfo, LaunchError> {
        let node_id = target.node_id;
        let mut endpoint = target.endpoint;
        let mut running_reported = false;

        info!(
            node_id = %node_id,
            max_attempts = self.config.max_attempts,
            "Launching node"
        );

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = self.config.backoff.delay(attempt - 1);
                debug!(node_id = %node_id, attempt, delay_ms = delay.as_millis() as u64, "Launch backoff");
                tokio::time::sleep(delay).await;
            }

            let report = match tokio::time::timeout(
                self.config.status_timeout,
                self.gateway.poll_status(&node_id),
            )
            .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(LookupError::NotFound(msg))) => {
                    warn!(node_id = %node_id, "Node disappeared during launch");
                    return Err(LaunchError::NodeLost(msg));
                }
                Ok(Err(LookupError::BackendUnavailable(msg))) => {
                    debug!(node_id = %node_id, attempt, error = %msg, "Status lookup failed");
                    continue;
                }
                Err(_) => {
                    debug!(node_id = %node_id, attempt, "Status lookup timed out");
                    continue;
                }
            };

            if report.endpoint.is_some() {
                endpoint = report.endpoint;
            }

            match report.status {
                BackendStatus::Running => {}
                BackendStatus::Terminated => {
                    warn!(node_id = %node_id, "Node terminated during launch");
                    return Err(LaunchError::NodeLost("backend reports node terminated".to_string()));
                }
                status => {
                    debug!(node_id = %node_id, attempt, status = %status, "Node not running yet");
                    continue;
                }
            }

            if !running_reported {
                running_reported = true;
                let _ = events.send(LaunchEvent::Running {
                    node_id: node_id.clone(),
                });
            }

            let Some(endpoint) = endpoint.as_deref() else {
                debug!(node_id = %node_id, attempt, "No agent endpoint reported yet");
                continue;
            };

            match self
                .connector
                .handshake(&node_id, endpoint, target.handshake_token.as_deref())
                .await
            {
                Ok(info) => {
                    info!(
                        node_id = %node_id,
                        attempts = attempt + 1,
                        agent_version = %info.agent_version,
                        "Agent handshake succeeded"
                    );
                    return Ok(info);
                }
                Err(LaunchError::HandshakeRejected(reason)) => {
                    warn!(node_id = %node_id, reason = %reason, "Agent rejected handshake");
                    return Err(LaunchError::HandshakeRejected(reason));
                }
                Err(e) => {
                    debug!(node_id = %node_id, attempt, error = %e, "Handshake attempt failed");
                }
            }
        }

        warn!(
            node_id = %node_id,
            attempts = self.config.max_attempts,
            "Launch attempts exhausted"
        );
        Err(LaunchError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }
}

// =============================================================================
// TCP handshake
// =============================================================================

/// Hello message sent to the agent.
#[derive(Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol: u32,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Ack message from the agent.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub accepted: bool,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Handshake over TCP with newline-delimited JSON.
pub struct TcpAgentConnector {
    /// Timeout for connect + hello + ack.
    timeout: Duration,
}

impl TcpAgentConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(
        &self,
        node_id: &NodeId,
        endpoint: &str,
        token: Option<&str>,
    ) -> Result<AckMessage, LaunchError> {
        let mut stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| LaunchError::Unreachable(format!("connect {}: {}", endpoint, e)))?;

        let hello = HelloMessage {
            msg_type: "hello".to_string(),
            protocol: PROTOCOL_VERSION,
            node_id: node_id.to_string(),
            token: token.map(str::to_string),
        };
        let mut line = serde_json::to_string(&hello)
            .map_err(|e| LaunchError::Unreachable(format!("encode hello: {}", e)))?;
        line.push('\n');

        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| LaunchError::Unreachable(format!("send hello: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| LaunchError::Unreachable(format!("send hello: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader
            .read_line(&mut reply)
            .await
            .map_err(|e| LaunchError::Unreachable(format!("read ack: {}", e)))?;

        if reply.is_empty() {
            return Err(LaunchError::Unreachable("agent closed connection".to_string()));
        }

        serde_json::from_str(&reply)
            .map_err(|e| LaunchError::Unreachable(format!("invalid ack: {}", e)))
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn handshake(
        &self,
        node_id: &NodeId,
        endpoint: &str,
        token: Option<&str>,
    ) -> Result<AgentInfo, LaunchError> {
        let ack = tokio::time::timeout(self.timeout, self.exchange(node_id, endpoint, token))
            .await
            .map_err(|_| LaunchError::Unreachable(format!("handshake with {} timed out", endpoint)))??;

        if ack.msg_type != "ack" {
            return Err(LaunchError::Unreachable(format!(
                "expected 'ack' message, got '{}'",
                ack.msg_type
            )));
        }

        if !ack.accepted {
            return Err(LaunchError::HandshakeRejected(
                ack.reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(AgentInfo {
            agent_version: ack.agent_version.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
