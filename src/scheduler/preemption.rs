//! Preemption: deliberately inert
//!
//! This extender never nominates victims: evicting a running pod cannot
//! free another pod's node-local data, so preempting for local capacity
//! would only churn workloads. The scheduler receives an empty victim map
//! and falls back to its other options.

use std::collections::BTreeMap;

use super::extender::{ExtenderPreemptionArgs, ExtenderPreemptionResult};
use super::PlacementEngine;

impl PlacementEngine {
    /// Answer a preemption probe with an empty victim map
    pub fn handle_preemption(&self, _args: ExtenderPreemptionArgs) -> ExtenderPreemptionResult {
        ExtenderPreemptionResult {
            node_name_to_meta_victims: Some(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::extender::{ExtenderPreemptionResult, MetaVictims};
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_victim_map_serializes() {
        let result = ExtenderPreemptionResult {
            node_name_to_meta_victims: Some(BTreeMap::<String, MetaVictims>::new()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"NodeNameToMetaVictims": {}})
        );
    }
}
