//! PersistentVolume and claim helpers
//!
//! Shared inspection helpers over the orchestrator's volume objects: claim
//! keys, capacity quantities, node affinity and the reclaim/publish markers
//! this driver stamps on its volumes.

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::constants::{PUBLISH_SUCCEEDED_ANNOTATION, RECLAIM_FINALIZER, TOPOLOGY_NODE_KEY};
use crate::error::{Error, Result};

/// One gibibyte in bytes
pub const GIB: u64 = 1024 * 1024 * 1024;

/// One mebibyte in bytes
pub const MIB: u64 = 1024 * 1024;

// =============================================================================
// Claim Keys
// =============================================================================

/// Build the `namespace/name` key identifying a claim in the capacity ledger
pub fn claim_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` claim key
pub fn split_claim_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
}

// =============================================================================
// Capacity Quantities
// =============================================================================

/// Parse a Kubernetes resource quantity into bytes.
///
/// Accepts plain integers, decimal suffixes (k, M, G, T, P, E), binary
/// suffixes (Ki, Mi, Gi, Ti, Pi, Ei) and scientific notation (`12e6`).
pub fn parse_quantity(q: &Quantity) -> Result<u64> {
    parse_quantity_str(&q.0)
}

fn parse_quantity_str(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty quantity".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num_str, rest) = s.split_at(num_end);

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", s)))?;

    // Scientific notation: an 'e'/'E' followed by an integer exponent.
    // A bare trailing 'E' is the exabyte suffix instead.
    if let Some(exp_str) = rest.strip_prefix(['e', 'E']) {
        if let Ok(exp) = exp_str.parse::<i32>() {
            let value = num * 10f64.powi(exp);
            if !(0.0..=u64::MAX as f64).contains(&value) {
                return Err(Error::CapacityParse(format!("out of range: {}", s)));
            }
            return Ok(value as u64);
        }
    }

    let multiplier: u64 = match rest {
        "" => 1,
        "k" => 1000,
        "M" => 1000_u64.pow(2),
        "G" => 1000_u64.pow(3),
        "T" => 1000_u64.pow(4),
        "P" => 1000_u64.pow(5),
        "E" => 1000_u64.pow(6),
        "Ki" => 1024,
        "Mi" => 1024_u64.pow(2),
        "Gi" => 1024_u64.pow(3),
        "Ti" => 1024_u64.pow(4),
        "Pi" => 1024_u64.pow(5),
        "Ei" => 1024_u64.pow(6),
        _ => {
            return Err(Error::CapacityParse(format!("unknown suffix: {}", rest)));
        }
    };

    let value = num * multiplier as f64;
    if !(0.0..=u64::MAX as f64).contains(&value) {
        return Err(Error::CapacityParse(format!("out of range: {}", s)));
    }
    Ok(value as u64)
}

/// Round a byte count up to whole gibibytes, the unit the capacity ledger
/// accounts in
pub fn gib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

// =============================================================================
// PersistentVolume Inspection
// =============================================================================

/// Whether the volume's required node affinity pins it to the given node
/// through this driver's topology key
pub fn pv_on_node(pv: &PersistentVolume, node: &str) -> bool {
    let Some(selector) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
    else {
        return false;
    };

    selector.node_selector_terms.iter().any(|term| {
        term.match_expressions.iter().flatten().any(|expr| {
            expr.key == TOPOLOGY_NODE_KEY
                && expr.values.iter().flatten().any(|value| value == node)
        })
    })
}

/// The `namespace/name` key of the claim bound to this volume
pub fn pv_claim_key(pv: &PersistentVolume) -> Option<String> {
    let claim_ref = pv.spec.as_ref()?.claim_ref.as_ref()?;
    Some(claim_key(
        claim_ref.namespace.as_deref()?,
        claim_ref.name.as_deref()?,
    ))
}

/// The volume's storage capacity in bytes
pub fn pv_capacity_bytes(pv: &PersistentVolume) -> Option<u64> {
    let capacity = pv.spec.as_ref()?.capacity.as_ref()?;
    parse_quantity(capacity.get("storage")?).ok()
}

/// Whether the volume has reached the `Bound` phase
pub fn pv_is_bound(pv: &PersistentVolume) -> bool {
    pv.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Bound")
        .unwrap_or(false)
}

/// Whether the first publish has completed, i.e. the volume's usage is
/// reflected in the volume group's free capacity
pub fn pv_is_published(pv: &PersistentVolume) -> bool {
    pv.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(PUBLISH_SUCCEEDED_ANNOTATION))
        .unwrap_or(false)
}

/// Whether the volume still carries the reclaim finalizer
pub fn pv_has_reclaim_finalizer(pv: &PersistentVolume) -> bool {
    pv.metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == RECLAIM_FINALIZER)
}

/// Whether the volume is released with a delete policy and still gated by
/// the reclaim finalizer, i.e. its backing device must now be removed
pub fn pv_awaiting_reclaim(pv: &PersistentVolume) -> bool {
    let released = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Released")
        .unwrap_or(false);
    let delete_policy = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .map(|policy| policy == "Delete")
        .unwrap_or(false);

    released && delete_policy && pv_has_reclaim_finalizer(pv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectReference,
        PersistentVolumeSpec, PersistentVolumeStatus, VolumeNodeAffinity,
    };
    use std::collections::BTreeMap;

    fn pv_for_node(node: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: TOPOLOGY_NODE_KEY.into(),
                                operator: "In".into(),
                                values: Some(vec![node.into()]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_key_round_trip() {
        let key = claim_key("default", "data-0");
        assert_eq!(key, "default/data-0");
        assert_eq!(split_claim_key(&key), Some(("default", "data-0")));
        assert_eq!(split_claim_key("no-slash"), None);
        assert_eq!(split_claim_key("/name"), None);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity_str("1024").unwrap(), 1024);
        assert_eq!(parse_quantity_str("5Gi").unwrap(), 5 * GIB);
        assert_eq!(parse_quantity_str("512Mi").unwrap(), 512 * MIB);
        assert_eq!(parse_quantity_str("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity_str("1.5Gi").unwrap(), GIB + GIB / 2);
        assert_eq!(parse_quantity_str("12e6").unwrap(), 12_000_000);
        assert_eq!(parse_quantity_str("2Ti").unwrap(), 2 * 1024 * GIB);

        assert!(parse_quantity_str("").is_err());
        assert!(parse_quantity_str("abc").is_err());
        assert!(parse_quantity_str("5Xi").is_err());
    }

    #[test]
    fn test_gib_ceil() {
        assert_eq!(gib_ceil(0), 0);
        assert_eq!(gib_ceil(1), 1);
        assert_eq!(gib_ceil(GIB), 1);
        assert_eq!(gib_ceil(GIB + 1), 2);
        assert_eq!(gib_ceil(5 * GIB), 5);
    }

    #[test]
    fn test_pv_on_node() {
        let pv = pv_for_node("node-1");
        assert!(pv_on_node(&pv, "node-1"));
        assert!(!pv_on_node(&pv, "node-2"));
        assert!(!pv_on_node(&PersistentVolume::default(), "node-1"));
    }

    #[test]
    fn test_pv_claim_key() {
        let mut pv = pv_for_node("node-1");
        pv.spec.as_mut().unwrap().claim_ref = Some(ObjectReference {
            namespace: Some("default".into()),
            name: Some("data-0".into()),
            ..Default::default()
        });
        assert_eq!(pv_claim_key(&pv).as_deref(), Some("default/data-0"));
        assert_eq!(pv_claim_key(&PersistentVolume::default()), None);
    }

    #[test]
    fn test_pv_capacity_bytes() {
        let mut pv = pv_for_node("node-1");
        let mut capacity = BTreeMap::new();
        capacity.insert("storage".to_string(), Quantity("5Gi".into()));
        pv.spec.as_mut().unwrap().capacity = Some(capacity);
        assert_eq!(pv_capacity_bytes(&pv), Some(5 * GIB));
    }

    #[test]
    fn test_pv_awaiting_reclaim() {
        let mut pv = pv_for_node("node-1");
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Released".into()),
            ..Default::default()
        });
        pv.spec.as_mut().unwrap().persistent_volume_reclaim_policy = Some("Delete".into());
        assert!(!pv_awaiting_reclaim(&pv));

        pv.metadata.finalizers = Some(vec![RECLAIM_FINALIZER.into()]);
        assert!(pv_awaiting_reclaim(&pv));

        pv.status.as_mut().unwrap().phase = Some("Bound".into());
        assert!(!pv_awaiting_reclaim(&pv));
    }

    #[test]
    fn test_pv_published_marker() {
        let mut pv = pv_for_node("node-1");
        assert!(!pv_is_published(&pv));
        let mut annotations = BTreeMap::new();
        annotations.insert(PUBLISH_SUCCEEDED_ANNOTATION.to_string(), "true".to_string());
        pv.metadata.annotations = Some(annotations);
        assert!(pv_is_published(&pv));
    }
}
