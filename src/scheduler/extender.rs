//! Scheduler extender wire types
//!
//! JSON request/response bodies exchanged with kube-scheduler's extender
//! webhooks. Field casing mirrors the upstream extender v1 schema: the
//! top-level argument/result fields serialize PascalCase, while host
//! priorities and victim details use their explicit lowercase tags.

use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The node list payload carried in extender filter calls
pub type NodeList = k8s_openapi::List<Node>;

// =============================================================================
// Filter (Predicate)
// =============================================================================

/// Arguments for predicate and prioritize calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderArgs {
    /// Pod being scheduled
    pub pod: Option<Pod>,
    /// Candidate nodes (full objects)
    pub nodes: Option<NodeList>,
    /// Candidate node names, when the scheduler is configured to send
    /// names only
    pub node_names: Option<Vec<String>>,
}

/// Result of a predicate call: the feasible subset plus a failure reason
/// per rejected node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderFilterResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Priorities
// =============================================================================

/// Score assigned to one candidate node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

/// Highest score an extender may assign
pub const MAX_PRIORITY: i64 = 100;

// =============================================================================
// Bind
// =============================================================================

/// Arguments for the bind call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderBindingArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    pub node: String,
}

/// Result of the bind call; a `None` error means the binding succeeded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderBindingResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Preemption
// =============================================================================

/// Arguments for the preemption call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderPreemptionArgs {
    pub pod: Option<Pod>,
    pub node_name_to_victims: Option<BTreeMap<String, Victims>>,
    pub node_name_to_meta_victims: Option<BTreeMap<String, MetaVictims>>,
}

/// Result of the preemption call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderPreemptionResult {
    pub node_name_to_meta_victims: Option<BTreeMap<String, MetaVictims>>,
}

/// Pods the scheduler proposes to evict from one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Victims {
    pub pods: Option<Vec<Pod>>,
    #[serde(rename = "numPDBViolations")]
    pub num_pdb_violations: i64,
}

/// Victim metadata variant carrying pod identifiers only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaVictims {
    pub pods: Option<Vec<MetaPod>>,
    #[serde(rename = "numPDBViolations")]
    pub num_pdb_violations: i64,
}

/// A victim pod referenced by UID
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaPod {
    pub uid: String,
}
