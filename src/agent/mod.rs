//! Node agent reconcilers
//!
//! Two per-node control loops keep the cluster's view of local storage
//! truthful:
//!
//! - [`CapacityReconciler`] refreshes this node's [`CapacityLedger`] from
//!   the volume group and retires reservations once their claims' usage is
//!   reflected in the free capacity.
//! - [`VolumeReclaimer`] deletes the backing logical volume of released
//!   volumes and lifts their reclaim finalizer.
//!
//! Both run on the controller runtime's per-key work queues: one reconcile
//! in flight per key, level-triggered, at-least-once, with backoff-driven
//! requeue on error and periodic resync on success.

mod reclaim;
mod reconciler;

pub use reclaim::VolumeReclaimer;
pub use reconciler::CapacityReconciler;

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::{Error, ErrorAction};

// =============================================================================
// Configuration
// =============================================================================

/// Immutable node agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name of the node this agent runs on; also the ledger object name
    pub node_name: String,
    /// How often a healthy ledger is re-verified against the volume group
    pub resync_interval: Duration,
}

impl AgentConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            resync_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Error Policy
// =============================================================================

/// Translate an error's retry classification into a work-queue action
pub(crate) fn requeue_for(err: &Error) -> Action {
    match err.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(10)),
        ErrorAction::RequeueAfter(after) => Action::requeue(after),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}
