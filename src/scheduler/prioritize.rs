//! Node scoring
//!
//! Scores grow with post-placement residual capacity, normalized into
//! [0, 100]: the node left with the most free local storage after the pod
//! lands scores highest. When neither the pod nor any node carries a
//! capacity signal, a small random jitter spreads stateless pods instead
//! of piling them onto one node. Output order is by node name so results
//! are deterministic.

use rand::Rng;
use tracing::info;

use super::extender::{ExtenderArgs, HostPriority, MAX_PRIORITY};
use super::PlacementEngine;
use crate::error::{Error, Result};

/// Jitter ceiling used when there is no capacity signal at all
const JITTER_MAX: i64 = 10;

/// Score candidate nodes from their available capacity. `available` is
/// `None` for nodes without a ledger; they score zero.
pub(crate) fn score_nodes<R: Rng>(
    capacities: &[(String, Option<u64>)],
    requested_gib: u64,
    rng: &mut R,
) -> Vec<HostPriority> {
    let residuals: Vec<u64> = capacities
        .iter()
        .map(|(_, available)| available.unwrap_or(0).saturating_sub(requested_gib))
        .collect();
    let max_residual = residuals.iter().copied().max().unwrap_or(0);

    // No demand and no headroom anywhere: any deterministic formula would
    // send every such pod to the same node, so spread them randomly.
    let no_signal = requested_gib == 0 && max_residual == 0;

    let mut priorities: Vec<HostPriority> = capacities
        .iter()
        .zip(residuals)
        .map(|((host, _), residual)| {
            let score = if no_signal {
                rng.gen_range(0..=JITTER_MAX)
            } else if max_residual > 0 {
                (residual * MAX_PRIORITY as u64 / max_residual) as i64
            } else {
                0
            };
            HostPriority {
                host: host.clone(),
                score,
            }
        })
        .collect();

    priorities.sort_by(|a, b| a.host.cmp(&b.host));
    priorities
}

impl PlacementEngine {
    /// Score the candidate nodes for a pod
    pub async fn handle_prioritize(&self, args: ExtenderArgs) -> Result<Vec<HostPriority>> {
        let pod = args
            .pod
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("extender args carried no pod".into()))?;

        let claims = self.pod_claims(pod).await?;
        let requested: u64 = claims.iter().map(|c| c.size_gib).sum();

        let candidates = args.nodes.map(|list| list.items).unwrap_or_default();
        let mut capacities = Vec::with_capacity(candidates.len());
        for node in &candidates {
            let name = node.metadata.name.clone().unwrap_or_default();
            let available = self.node_available_gib(&name).await?;
            capacities.push((name, available));
        }

        let priorities = score_nodes(&capacities, requested, &mut rand::thread_rng());
        info!(
            "prioritize: pod {}/{} requested {}GiB over {} nodes",
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or(""),
            requested,
            priorities.len()
        );
        Ok(priorities)
    }
}
