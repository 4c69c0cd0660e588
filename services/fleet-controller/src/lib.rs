//! Fleet controller library.
//!
//! Keeps a fleet of cloud compute nodes sized to demand: provisions nodes
//! through a backend gateway, brings them online with an agent handshake,
//! and suspends or destroys them once they sit idle.
//!
//! ## Architecture
//!
//! - **Controller**: single loop task that owns every `NodeHandle`
//! - **Gateway**: the cloud backend behind the `ProvisioningGateway` trait
//! - **Launch**: per-node tasks that poll status and perform the handshake
//! - **Surface**: `FleetHandle`, the cloneable command channel into the loop
//! - **State**: SQLite checkpoint used to reconcile after restarts
//!
//! Pure decision logic (retention, demand arithmetic, backoff) lives in
//! the `fleet-reconcile` library.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod launch;
pub mod node;
pub mod state;
pub mod surface;

pub use controller::{ControllerConfig, FleetController, RecoveryReport, ShutdownReport};
pub use error::{LaunchError, LookupError, ProvisionError, ReclaimError};
pub use gateway::{MockGateway, ProvisioningGateway};
pub use launch::{AgentConnector, LaunchConfig, TcpAgentConnector};
pub use node::{NodeHandle, NodeId, NodeSnapshot, NodeState};
pub use surface::{DemandSnapshot, FleetHandle, SurfaceError};
