//! Application state shared across request handlers.

use std::sync::Arc;

use crate::surface::FleetHandle;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    fleet: FleetHandle,
    gateway_name: String,
}

impl AppState {
    pub fn new(fleet: FleetHandle, gateway_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                fleet,
                gateway_name: gateway_name.into(),
            }),
        }
    }

    /// Handle to the controller loop.
    pub fn fleet(&self) -> &FleetHandle {
        &self.inner.fleet
    }

    pub fn gateway_name(&self) -> &str {
        &self.inner.gateway_name
    }
}
