//! Demand arithmetic for provisioning.

use crate::DEFAULT_PROVISION_CAP;

/// What a single tick should do for one label-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisionPlan {
    /// New provisioning calls to issue this tick.
    pub to_request: u32,

    /// Unmet demand that did not fit under the cap and waits for a later tick.
    pub queued: u32,
}

impl ProvisionPlan {
    pub fn unmet(&self) -> u32 {
        self.to_request + self.queued
    }
}

/// Bounds how fast the fleet grows toward demand.
#[derive(Debug, Clone)]
pub struct ProvisioningStrategy {
    /// Maximum provisioning calls outstanding at once, across all label-sets.
    pub max_concurrent: u32,
}

impl Default for ProvisioningStrategy {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_PROVISION_CAP,
        }
    }
}

impl ProvisioningStrategy {
    /// Calculate provisioning for one label-set.
    ///
    /// `supplied` counts eligible nodes in {Idle, Busy, Provisioning,
    /// Launching} plus provisioning calls already outstanding for this
    /// label-set. `outstanding` is the fleet-wide number of outstanding
    /// provisioning calls, including those issued earlier in this tick.
    pub fn calculate(&self, required: u32, supplied: u32, outstanding: u32) -> ProvisionPlan {
        let unmet = required.saturating_sub(supplied);
        let room = self.max_concurrent.saturating_sub(outstanding);
        let to_request = unmet.min(room);

        ProvisionPlan {
            to_request,
            queued: unmet - to_request,
        }
    }
}
