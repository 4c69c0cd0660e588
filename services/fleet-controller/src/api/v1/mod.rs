//! API v1 routes.

mod demand;
mod nodes;

use axum::Router;
use serde::Serialize;

use super::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::routes())
        .nest("/demand", demand::routes())
}

/// List envelope shared by collection endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}
