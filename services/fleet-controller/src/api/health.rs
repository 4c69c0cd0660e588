//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            service: "fleetd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            gateway: None,
            message: None,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: the server is up. Does not check the controller.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::new("ok"))
}

/// Readiness: the controller loop answers commands.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.fleet().list_demand().await {
        Ok(_) => {
            let mut response = HealthResponse::new("ok");
            response.gateway = Some(state.gateway_name().to_string());
            (StatusCode::OK, Json(response))
        }
        Err(e) => {
            let mut response = HealthResponse::new("degraded");
            response.message = Some(e.to_string());
            (StatusCode::SERVICE_UNAVAILABLE, Json(response))
        }
    }
}
