//! Placement engine
//!
//! Scheduler-extender backend deciding where pods with local volume claims
//! may run. Feasibility and scoring read the per-node [`CapacityLedger`]
//! together with the sizes of in-flight reservations; bind commits a
//! reservation before handing the pod to the node.
//!
//! The capacity arithmetic lives in pure functions ([`predicate`],
//! [`prioritize`]); this module gathers their inputs from the cluster.

mod bind;
mod extender;
mod predicate;
mod preemption;
mod prioritize;
mod routes;

pub use bind::{KubePodBinder, PodBinder};
pub use extender::{
    ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderFilterResult,
    ExtenderPreemptionArgs, ExtenderPreemptionResult, HostPriority, MetaPod, MetaVictims, NodeList,
    Victims, MAX_PRIORITY,
};
pub use routes::extender_router;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
use tracing::debug;

use crate::constants::DRIVER_NAME;
use crate::error::Result;
use crate::ledger::{KubeLedgerClient, LedgerStore};
use crate::volumes::{claim_key, gib_ceil, parse_quantity, split_claim_key};

// =============================================================================
// Configuration
// =============================================================================

/// Immutable placement engine configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Provisioner name claims must reference to participate in capacity
    /// accounting
    pub driver_name: String,
    /// Name segment of the predicate route
    pub predicate_name: String,
    /// Name segment of the priority route
    pub priority_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            driver_name: DRIVER_NAME.to_string(),
            predicate_name: "local-capacity".to_string(),
            priority_name: "capacity-spread".to_string(),
        }
    }
}

// =============================================================================
// Claim Requests
// =============================================================================

/// One qualifying claim of the pod being scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// `namespace/claimName` ledger key
    pub key: String,
    /// Requested size rounded up to whole GiB
    pub size_gib: u64,
}

// =============================================================================
// Placement Engine
// =============================================================================

/// The extender backend shared by all scheduler routes
pub struct PlacementEngine {
    client: Client,
    ledgers: LedgerStore<KubeLedgerClient>,
    binder: Box<dyn PodBinder>,
    config: SchedulerConfig,
}

impl PlacementEngine {
    pub fn new(client: Client, config: SchedulerConfig) -> Self {
        let ledgers = LedgerStore::new(KubeLedgerClient::new(client.clone()));
        let binder = Box::new(KubePodBinder::new(client.clone()));
        Self {
            client,
            ledgers,
            binder,
            config,
        }
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The pod's claims that resolve, through their StorageClass, to this
    /// driver. Claims that do not resolve (deleted claim or class) are
    /// skipped; transient API failures propagate so the scheduler retries.
    pub(crate) async fn pod_claims(&self, pod: &Pod) -> Result<Vec<ClaimRequest>> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let classes: Api<StorageClass> = Api::all(self.client.clone());

        let mut result = Vec::new();
        for volume in pod.spec.iter().flat_map(|s| s.volumes.iter().flatten()) {
            let Some(source) = &volume.persistent_volume_claim else {
                continue;
            };
            let Some(claim) = claims.get_opt(&source.claim_name).await? else {
                debug!("claim {}/{} not found, skipping", namespace, source.claim_name);
                continue;
            };
            let Some(class_name) = claim
                .spec
                .as_ref()
                .and_then(|s| s.storage_class_name.clone())
            else {
                continue;
            };
            let Some(class) = classes.get_opt(&class_name).await? else {
                continue;
            };
            if class.provisioner != self.config.driver_name {
                continue;
            }

            result.push(ClaimRequest {
                key: claim_key(namespace, &source.claim_name),
                size_gib: claim_request_gib(&claim),
            });
        }
        Ok(result)
    }

    /// Capacity still schedulable on a node: ledger free capacity minus
    /// every reservation not yet reflected in it. `None` when the node has
    /// no ledger.
    pub(crate) async fn node_available_gib(&self, node: &str) -> Result<Option<u64>> {
        let Some(ledger) = self.ledgers.get(node).await? else {
            return Ok(None);
        };

        let mut reserved = 0u64;
        for key in ledger.reservations() {
            let Some((namespace, name)) = split_claim_key(&key) else {
                continue;
            };
            reserved += self.reserved_claim_gib(namespace, name).await?;
        }
        Ok(Some(ledger.free_capacity().saturating_sub(reserved)))
    }

    /// Size of one reserved claim; a claim that no longer resolves holds
    /// no capacity
    async fn reserved_claim_gib(&self, namespace: &str, name: &str) -> Result<u64> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(claims
            .get_opt(name)
            .await?
            .map(|claim| claim_request_gib(&claim))
            .unwrap_or(0))
    }
}

/// Requested storage of a claim, rounded up to whole GiB
pub(crate) fn claim_request_gib(claim: &PersistentVolumeClaim) -> u64 {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .and_then(|quantity| parse_quantity(quantity).ok())
        .map(gib_ceil)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::api::core::v1::VolumeResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn claim_with_request(request: &str) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(request.into()));
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_request_gib_rounds_up() {
        assert_eq!(claim_request_gib(&claim_with_request("5Gi")), 5);
        assert_eq!(claim_request_gib(&claim_with_request("1500Mi")), 2);
        assert_eq!(claim_request_gib(&claim_with_request("512Mi")), 1);
        assert_eq!(claim_request_gib(&PersistentVolumeClaim::default()), 0);
    }

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.driver_name, DRIVER_NAME);
        assert_eq!(config.predicate_name, "local-capacity");
        assert_eq!(config.priority_name, "capacity-spread");
    }
}
