//! Local Volume Operator
//!
//! Node-local LVM volume provisioning for Kubernetes. Each node's free
//! volume-group capacity is published as a cluster-visible `CapacityLedger`
//! resource; a scheduler extender filters and scores nodes against that
//! ledger and reserves capacity at bind time; a node agent keeps the ledger
//! truthful and reclaims released volumes; a CSI driver turns a capacity
//! claim into a formatted, mounted, resizable logical volume.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Extender                            │
//! │         predicate / prioritize / bind  (capacity ledger)             │
//! └────────────────────────────────┬─────────────────────────────────────┘
//!                                  │ reserves capacity at bind
//!                    ┌─────────────┴─────────────┐
//!                    │   CapacityLedger (CRD)    │
//!                    │  total / free / reserved  │
//!                    └─────────────┬─────────────┘
//!              refreshes + prunes  │        reads
//! ┌────────────────────────────────┴─────────────────────────────────────┐
//! │                          Node Agent                                  │
//! │   capacity reconciler · volume reclaimer · VG bootstrap              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                          CSI Driver                                  │
//! │   identity · controller (topology) · node (publish/unpublish)        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     Device Command Layer (LVM)                       │
//! │   vgcreate/lvcreate/lvextend/lvremove · mkfs/blkid · mount/umount    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`agent`]: node-local reconcilers keeping the ledger truthful
//! - [`crd`]: the `CapacityLedger` custom resource
//! - [`driver`]: CSI identity/controller/node services
//! - [`ledger`]: optimistic-concurrency access to the capacity ledger
//! - [`lvm`]: synchronous wrappers around host LVM/filesystem tooling
//! - [`scheduler`]: the scheduler-extender placement engine
//! - [`error`]: error types and handling

pub mod agent;
pub mod constants;
pub mod crd;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod lvm;
pub mod scheduler;
pub mod volumes;

// Re-export commonly used types
pub use crd::{CapacityLedger, CapacityLedgerSpec, CapacityLedgerStatus};

pub use error::{Error, ErrorAction, Result};

pub use ledger::{KubeLedgerClient, LedgerClient, LedgerStore, UpdateOutcome};

pub use lvm::{DeviceOps, HostLvm, LvmConfig, SizeSpec, VgReport, VolumeLayout};

pub use scheduler::{PlacementEngine, SchedulerConfig};

pub use agent::{AgentConfig, CapacityReconciler, VolumeReclaimer};

pub use driver::{DriverConfig, DriverServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
