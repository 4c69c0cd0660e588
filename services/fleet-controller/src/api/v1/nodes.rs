//! Node endpoints.
//!
//! Scheduler-facing operations on individual nodes: activity reports,
//! work assignment and forced reclaim.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::node::NodeId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/activity", post(report_activity))
        .route("/{node_id}/reclaim", post(force_reclaim))
        .route("/{node_id}/assign", post(assign_work))
        .route("/{node_id}/complete", post(complete_work))
}

async fn list_nodes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let items = state.fleet().list_nodes().await?;
    Ok(Json(ListResponse { items }))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.fleet().get_node(&NodeId::new(node_id)).await?;
    Ok(Json(node))
}

async fn report_activity(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = NodeId::new(node_id);
    state.fleet().report_activity(node_id.clone()).await?;
    Ok(Json(state.fleet().get_node(&node_id).await?))
}

/// Reclaim happens on the next tick, so the request is only accepted here.
async fn force_reclaim(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = NodeId::new(node_id);
    state.fleet().force_reclaim(node_id.clone()).await?;
    let node = state.fleet().get_node(&node_id).await?;
    Ok((StatusCode::ACCEPTED, Json(node)))
}

async fn assign_work(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = NodeId::new(node_id);
    state.fleet().assign_work(node_id.clone()).await?;
    Ok(Json(state.fleet().get_node(&node_id).await?))
}

async fn complete_work(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = NodeId::new(node_id);
    state.fleet().complete_work(node_id.clone()).await?;
    Ok(Json(state.fleet().get_node(&node_id).await?))
}
