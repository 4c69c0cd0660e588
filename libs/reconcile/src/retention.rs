//! Retention policy evaluation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_IDLE_TIMEOUT;

/// Outcome of evaluating one node against the retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionDecision {
    /// Leave the node as it is.
    Keep,

    /// Reclaim by suspending (resumable).
    Suspend,

    /// Reclaim by destroying (irrecoverable).
    Destroy,
}

impl RetentionDecision {
    pub fn is_reclaim(&self) -> bool {
        !matches!(self, Self::Keep)
    }
}

/// Retention policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a node may sit idle before it is reclaimed.
    pub idle_timeout: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// The view of a node that retention decisions are made from.
pub trait RetentionSubject {
    /// Whether the node is idle (the only state retention applies to).
    fn is_idle(&self) -> bool;

    /// Whether reclaiming this node suspends it rather than destroying it.
    fn stop_on_reclaim(&self) -> bool;

    /// Last time the node did work or changed state.
    fn last_activity_at(&self) -> DateTime<Utc>;
}

/// Decide what to do with a node.
///
/// Reclaims when the node has been idle for strictly longer than the
/// idle timeout. A `last_activity_at` in the future counts as active.
pub fn decide<N>(node: &N, now: DateTime<Utc>, policy: &RetentionPolicy) -> RetentionDecision
where
    N: RetentionSubject + ?Sized,
{
    if !node.is_idle() {
        return RetentionDecision::Keep;
    }

    let idle_for = match now.signed_duration_since(node.last_activity_at()).to_std() {
        Ok(idle_for) => idle_for,
        Err(_) => return RetentionDecision::Keep,
    };

    if idle_for > policy.idle_timeout {
        reclaim_mode(node)
    } else {
        RetentionDecision::Keep
    }
}

/// Decide how to reclaim a node an operator asked to reclaim.
///
/// Ignores the idle timeout but still only reclaims idle nodes.
pub fn decide_forced<N>(node: &N) -> RetentionDecision
where
    N: RetentionSubject + ?Sized,
{
    if node.is_idle() {
        reclaim_mode(node)
    } else {
        RetentionDecision::Keep
    }
}

fn reclaim_mode<N: RetentionSubject + ?Sized>(node: &N) -> RetentionDecision {
    if node.stop_on_reclaim() {
        RetentionDecision::Suspend
    } else {
        RetentionDecision::Destroy
    }
}
