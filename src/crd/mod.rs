//! Custom Resource Definitions
//!
//! The operator owns a single CRD: [`CapacityLedger`], the per-node record
//! of local volume-group capacity and in-flight reservations.

mod capacity_ledger;

pub use capacity_ledger::{CapacityLedger, CapacityLedgerSpec, CapacityLedgerStatus};

/// API group for all operator resources
pub const API_GROUP: &str = "storage.localvolume.dev";
