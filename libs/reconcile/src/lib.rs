//! Decision primitives for the fleet control loop.
//!
//! This library holds the parts of fleet management that are pure
//! functions of their inputs, so they can be tested without a runtime:
//!
//! - **Labels**: capability tags and the eligibility relation between a
//!   node's labels and a demanded label-set.
//! - **Retention**: whether an idle node is kept, suspended or destroyed.
//! - **Demand**: how many provisioning requests a tick may issue.
//! - **Backoff**: retry delays for launch and reclaim attempts.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - No function here reads the clock; callers pass `now`

mod backoff;
mod demand;
mod labels;
mod retention;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use demand::{ProvisionPlan, ProvisioningStrategy};
pub use labels::{LabelSet, LabelSetError};
pub use retention::{decide, decide_forced, RetentionDecision, RetentionPolicy, RetentionSubject};

/// Default control loop tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Default idle timeout before a node is reclaimed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default cap on concurrently outstanding provisioning calls.
pub const DEFAULT_PROVISION_CAP: u32 = 4;

/// Default number of launch attempts before a node is failed.
pub const DEFAULT_LAUNCH_ATTEMPTS: u32 = 10;

/// Default timeout for `request_node` / `resume_node`.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for `suspend_node` / `destroy_node` / `poll_status`.
pub const DEFAULT_RECLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period for reclaiming the fleet on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
