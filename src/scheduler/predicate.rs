//! Feasibility filter
//!
//! A node can host a pod when its available capacity (ledger free capacity
//! minus unreflected reservations) strictly exceeds the pod's total
//! qualifying request. Pods without qualifying claims fit everywhere.

use std::collections::BTreeMap;

use tracing::{info, warn};

use super::extender::{ExtenderArgs, ExtenderFilterResult, NodeList};
use super::PlacementEngine;

/// The core feasibility rule. `available` is `None` for a node without a
/// ledger, which is infeasible rather than an error.
pub(crate) fn is_feasible(available_gib: Option<u64>, requested_gib: u64) -> bool {
    if requested_gib == 0 {
        return true;
    }
    match available_gib {
        Some(available) => available > requested_gib,
        None => false,
    }
}

/// Failure reason reported to the scheduler for an infeasible node
pub(crate) fn failure_reason(available_gib: Option<u64>, requested_gib: u64) -> String {
    match available_gib {
        Some(available) => format!(
            "insufficient local capacity: requested {}GiB, available {}GiB",
            requested_gib, available
        ),
        None => "no capacity ledger registered for node".to_string(),
    }
}

impl PlacementEngine {
    /// Filter the candidate nodes, reporting a per-node reason for every
    /// rejection. Failures resolving the pod's claims fail the whole call
    /// through the result's error field, never a partial answer.
    pub async fn handle_predicate(&self, args: ExtenderArgs) -> ExtenderFilterResult {
        let Some(pod) = args.pod.as_ref() else {
            return ExtenderFilterResult {
                error: Some("extender args carried no pod".to_string()),
                ..Default::default()
            };
        };

        let claims = match self.pod_claims(pod).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!("predicate: resolving pod claims failed: {}", e);
                return ExtenderFilterResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };
        let requested: u64 = claims.iter().map(|c| c.size_gib).sum();

        let candidates = args.nodes.map(|list| list.items).unwrap_or_default();
        let mut feasible = Vec::with_capacity(candidates.len());
        let mut failed = BTreeMap::new();

        for node in candidates {
            let name = node.metadata.name.clone().unwrap_or_default();
            match self.node_available_gib(&name).await {
                Ok(available) => {
                    if is_feasible(available, requested) {
                        feasible.push(node);
                    } else {
                        failed.insert(name, failure_reason(available, requested));
                    }
                }
                Err(e) => {
                    failed.insert(name, e.to_string());
                }
            }
        }

        info!(
            "predicate: pod {}/{} requested {}GiB, {} feasible, {} rejected",
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or(""),
            requested,
            feasible.len(),
            failed.len()
        );

        ExtenderFilterResult {
            nodes: Some(NodeList {
                items: feasible,
                ..Default::default()
            }),
            node_names: None,
            failed_nodes: failed,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feasible_with_headroom() {
        // ledger {total=20, free=20, reservations={}}; claim requests 5
        assert!(is_feasible(Some(20), 5));
    }

    #[test]
    fn test_infeasible_when_request_exceeds_free() {
        // ledger {total=100, free=10}; claim requests 20
        assert!(!is_feasible(Some(10), 20));
    }

    #[test]
    fn test_strict_inequality() {
        assert!(!is_feasible(Some(5), 5));
        assert!(is_feasible(Some(6), 5));
    }

    #[test]
    fn test_zero_request_always_fits() {
        assert!(is_feasible(Some(0), 0));
        assert!(is_feasible(None, 0));
    }

    #[test]
    fn test_missing_ledger_is_infeasible() {
        assert!(!is_feasible(None, 1));
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(
            failure_reason(Some(10), 20),
            "insufficient local capacity: requested 20GiB, available 10GiB"
        );
        assert_eq!(
            failure_reason(None, 20),
            "no capacity ledger registered for node"
        );
    }
}
