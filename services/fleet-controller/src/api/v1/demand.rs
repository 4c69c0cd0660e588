//! Demand endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fleet_reconcile::LabelSet;
use serde::Deserialize;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_demand).post(set_demand))
}

/// Request to set required capacity for a label-set.
#[derive(Debug, Deserialize)]
pub struct SetDemandRequest {
    #[serde(default)]
    pub labels: Vec<String>,

    /// Required node count. Zero removes the demand.
    pub count: u32,
}

async fn list_demand(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let items = state.fleet().list_demand().await?;
    Ok(Json(ListResponse { items }))
}

async fn set_demand(
    State(state): State<AppState>,
    Json(req): Json<SetDemandRequest>,
) -> Result<Response, ApiError> {
    let labels = LabelSet::from_labels(&req.labels)
        .map_err(|e| ApiError::bad_request("invalid_labels", e.to_string()))?;

    state
        .fleet()
        .request_capacity(labels.clone(), req.count)
        .await?;

    let entry = state
        .fleet()
        .list_demand()
        .await?
        .into_iter()
        .find(|d| d.labels == labels);

    Ok(match entry {
        Some(entry) => (StatusCode::ACCEPTED, Json(entry)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
