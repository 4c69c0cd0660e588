//! Gateway for a REST compute backend.
//!
//! Endpoints:
//! - `POST   /v1/nodes`              request a node
//! - `POST   /v1/nodes/{id}/resume`  resume a suspended node
//! - `POST   /v1/nodes/{id}/suspend` suspend a node
//! - `DELETE /v1/nodes/{id}`         destroy a node
//! - `GET    /v1/nodes/{id}`         node status

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BackendStatus, NodeSpec, ProvisionedNode, ProvisioningGateway, StatusReport};
use crate::error::{LookupError, ProvisionError, ReclaimError};
use crate::node::NodeId;

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Backend API base URL.
    pub base_url: String,

    /// Bearer token, if the backend requires one.
    pub token: Option<String>,

    /// Transport-level timeout for a single HTTP call.
    pub request_timeout: Duration,
}

/// REST compute backend client.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    handshake_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// How a failed response should be read, before mapping to an operation's error type.
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    NotFound(String),
    Quota(String),
    Invalid(String),
    Denied(String),
    Unavailable(String),
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/v1/nodes/{id}[/{action}]` with the id encoded as a single path segment.
    fn node_url(&self, id: &NodeId, action: Option<&str>) -> Result<reqwest::Url, Failure> {
        let mut url = reqwest::Url::parse(&self.url("/v1/nodes"))
            .map_err(|e| Failure::Unavailable(format!("bad backend url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Failure::Unavailable("backend url cannot carry a path".to_string()))?
            .push(id.as_str())
            .extend(action);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request, returning the successful response or a classified failure.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, Failure> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Failure::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let failure = classify(status, &body);
        debug!(status = %status, failure = ?failure, "Backend call failed");
        Err(failure)
    }
}

fn classify(status: StatusCode, body: &ErrorBody) -> Failure {
    let message = body
        .message
        .clone()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    let code = body.code.as_deref().unwrap_or_default();

    match status {
        StatusCode::NOT_FOUND => Failure::NotFound(message),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Failure::Denied(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::CONFLICT if code == "quota_exceeded" => {
            Failure::Quota(message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Failure::Invalid(message),
        _ => Failure::Unavailable(format!("{}: {}", status, message)),
    }
}

fn provision_error(failure: Failure) -> ProvisionError {
    match failure {
        Failure::Quota(m) => ProvisionError::QuotaExceeded(m),
        Failure::Invalid(m) | Failure::Denied(m) | Failure::NotFound(m) => {
            ProvisionError::InvalidSpec(m)
        }
        Failure::Unavailable(m) => ProvisionError::BackendUnavailable(m),
    }
}

fn reclaim_error(failure: Failure) -> ReclaimError {
    match failure {
        Failure::NotFound(m) => ReclaimError::NotFound(m),
        Failure::Denied(m) => ReclaimError::PermissionDenied(m),
        Failure::Quota(m) | Failure::Invalid(m) | Failure::Unavailable(m) => {
            ReclaimError::BackendUnavailable(m)
        }
    }
}

fn lookup_error(failure: Failure) -> LookupError {
    match failure {
        Failure::NotFound(m) => LookupError::NotFound(m),
        Failure::Quota(m) | Failure::Invalid(m) | Failure::Denied(m) | Failure::Unavailable(m) => {
            LookupError::BackendUnavailable(m)
        }
    }
}

#[async_trait]
impl ProvisioningGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn request_node(&self, spec: &NodeSpec) -> Result<ProvisionedNode, ProvisionError> {
        let request = self.client.post(self.url("/v1/nodes")).json(spec);
        let response = self.send(request).await.map_err(provision_error)?;

        let node: NodeResponse = response
            .json()
            .await
            .map_err(|e| ProvisionError::BackendUnavailable(format!("bad response: {}", e)))?;

        if node.id.is_empty() {
            return Err(ProvisionError::BackendUnavailable(
                "backend returned an empty node id".to_string(),
            ));
        }

        Ok(ProvisionedNode {
            id: NodeId::new(node.id),
            endpoint: node.endpoint,
            handshake_token: node.handshake_token,
        })
    }

    async fn resume_node(&self, id: &NodeId) -> Result<(), ProvisionError> {
        let url = self.node_url(id, Some("resume")).map_err(provision_error)?;
        self.send(self.client.post(url)).await.map_err(provision_error)?;
        Ok(())
    }

    async fn suspend_node(&self, id: &NodeId) -> Result<(), ReclaimError> {
        let url = self.node_url(id, Some("suspend")).map_err(reclaim_error)?;
        self.send(self.client.post(url)).await.map_err(reclaim_error)?;
        Ok(())
    }

    async fn destroy_node(&self, id: &NodeId) -> Result<(), ReclaimError> {
        let url = self.node_url(id, None).map_err(reclaim_error)?;
        match self.send(self.client.delete(url)).await {
            Ok(_) => Ok(()),
            Err(Failure::NotFound(_)) => {
                debug!(node_id = %id, "Destroy of missing node treated as success");
                Ok(())
            }
            Err(failure) => Err(reclaim_error(failure)),
        }
    }

    async fn poll_status(&self, id: &NodeId) -> Result<StatusReport, LookupError> {
        let url = self.node_url(id, None).map_err(lookup_error)?;
        let response = self.send(self.client.get(url)).await.map_err(lookup_error)?;

        let node: NodeResponse = response
            .json()
            .await
            .map_err(|e| LookupError::BackendUnavailable(format!("bad response: {}", e)))?;

        let raw = node.status.unwrap_or_default();
        let status = BackendStatus::from_backend(&raw);
        if status == BackendStatus::Unknown {
            warn!(node_id = %id, raw_status = %raw, "Unmapped backend status");
        }

        Ok(StatusReport {
            status,
            endpoint: node.endpoint,
        })
    }
}
