//! CapacityLedger CRD
//!
//! One cluster-scoped object per node, named after the node. The status
//! carries the node volume group's total and free capacity in GiB plus the
//! set of claims holding speculative capacity reservations made at
//! scheduling time, before their logical volume exists.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// CapacityLedger CRD
// =============================================================================

/// CapacityLedger tracks a node's local storage capacity. The node agent
/// refreshes `totalCapacity`/`freeCapacity` from the volume group and the
/// scheduler extender adds `reservations` entries at bind time; the agent
/// retires a reservation once the claim's volume is provisioned and its
/// usage shows up in the free capacity.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.localvolume.dev",
    version = "v1alpha1",
    kind = "CapacityLedger",
    plural = "capacityledgers",
    shortname = "cls",
    status = "CapacityLedgerStatus",
    printcolumn = r#"{"name": "Total", "type": "integer", "jsonPath": ".status.totalCapacity"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.freeCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct CapacityLedgerSpec {}

// =============================================================================
// Status
// =============================================================================

/// Observed capacity and in-flight reservations for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityLedgerStatus {
    /// Volume group size in GiB
    #[serde(default)]
    pub total_capacity: u64,

    /// Unallocated volume group capacity in GiB
    #[serde(default)]
    pub free_capacity: u64,

    /// Claims (`namespace/claimName`) holding capacity that is promised but
    /// not yet reflected in `freeCapacity`
    #[serde(default)]
    pub reservations: BTreeSet<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl CapacityLedger {
    /// The ledger's node, i.e. the object name
    pub fn node_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Free capacity in GiB, zero while status is unset
    pub fn free_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.free_capacity).unwrap_or(0)
    }

    /// Total capacity in GiB, zero while status is unset
    pub fn total_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.total_capacity).unwrap_or(0)
    }

    /// Claims currently holding a reservation on this node
    pub fn reservations(&self) -> BTreeSet<String> {
        self.status
            .as_ref()
            .map(|s| s.reservations.clone())
            .unwrap_or_default()
    }
}

impl CapacityLedgerStatus {
    /// Record freshly observed volume group capacity, clamping free to
    /// total so the `free <= total` invariant holds even if the two reads
    /// raced a concurrent allocation. Returns whether anything changed.
    pub fn record_capacity(&mut self, total_gib: u64, free_gib: u64) -> bool {
        let free_gib = free_gib.min(total_gib);
        if self.total_capacity == total_gib && self.free_capacity == free_gib {
            return false;
        }
        self.total_capacity = total_gib;
        self.free_capacity = free_gib;
        true
    }

    /// Add a reservation; a no-op when the claim is already reserved
    pub fn reserve(&mut self, claim_key: &str) -> bool {
        self.reservations.insert(claim_key.to_string())
    }

    /// Remove a reservation; a no-op when the claim holds none
    pub fn release(&mut self, claim_key: &str) -> bool {
        self.reservations.remove(claim_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_capacity_change_detection() {
        let mut status = CapacityLedgerStatus::default();
        assert!(status.record_capacity(100, 80));
        assert_eq!(status.total_capacity, 100);
        assert_eq!(status.free_capacity, 80);

        // identical observation is a no-op
        assert!(!status.record_capacity(100, 80));
    }

    #[test]
    fn test_record_capacity_clamps_free() {
        let mut status = CapacityLedgerStatus::default();
        assert!(status.record_capacity(50, 60));
        assert_eq!(status.free_capacity, 50);
        assert!(status.free_capacity <= status.total_capacity);
    }

    #[test]
    fn test_reserve_release_idempotent() {
        let mut status = CapacityLedgerStatus::default();
        assert!(status.reserve("default/data-0"));
        assert!(!status.reserve("default/data-0"));
        assert_eq!(status.reservations.len(), 1);

        assert!(status.release("default/data-0"));
        assert!(!status.release("default/data-0"));
        assert!(status.reservations.is_empty());
    }

    #[test]
    fn test_ledger_accessors_default_to_zero() {
        let ledger = CapacityLedger::new("node-1", CapacityLedgerSpec::default());
        assert_eq!(ledger.node_name(), "node-1");
        assert_eq!(ledger.total_capacity(), 0);
        assert_eq!(ledger.free_capacity(), 0);
        assert!(ledger.reservations().is_empty());
    }
}
