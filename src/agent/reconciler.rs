//! Capacity reconciler
//!
//! Keeps this node's [`CapacityLedger`] truthful: the volume group's
//! total/free capacity is re-read on every reconcile, and reservations
//! whose claims have a bound, published volume on this node are retired so
//! provisioned capacity is not counted twice (once as a reservation, once
//! in the refreshed free capacity). Capacity refresh and reservation
//! pruning land in a single status write, skipped entirely when nothing
//! changed.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use super::{requeue_for, AgentConfig};
use crate::crd::{CapacityLedger, CapacityLedgerStatus};
use crate::error::{Error, Result};
use crate::ledger::{KubeLedgerClient, LedgerClient, LedgerStore, UpdateOutcome};
use crate::lvm::{DeviceOps, VgReport};
use crate::volumes::{pv_claim_key, pv_is_bound, pv_is_published, pv_on_node};

// =============================================================================
// Capacity Reconciler
// =============================================================================

/// Per-node loop reconciling the capacity ledger against the volume group
pub struct CapacityReconciler {
    client: Client,
    config: AgentConfig,
    ledgers: LedgerStore<KubeLedgerClient>,
    device: Arc<dyn DeviceOps>,
}

impl CapacityReconciler {
    pub fn new(client: Client, config: AgentConfig, device: Arc<dyn DeviceOps>) -> Self {
        let ledgers = LedgerStore::new(KubeLedgerClient::new(client.clone()));
        Self {
            client,
            config,
            ledgers,
            device,
        }
    }

    /// Establish the volume group and register this node's ledger; called
    /// once at agent startup. Failure here is fatal: without a volume
    /// group the node must not advertise capacity.
    pub async fn bootstrap(&self) -> Result<()> {
        let device = self.device.clone();
        let pv_count = tokio::task::spawn_blocking(move || device.ensure_volume_group())
            .await
            .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;
        info!(
            "volume group ready with {} physical volume(s) on node {}",
            pv_count, self.config.node_name
        );

        self.ledgers.get_or_create(&self.config.node_name).await?;

        let device = self.device.clone();
        let report = tokio::task::spawn_blocking(move || device.volume_group())
            .await
            .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;
        if let Some(report) = report {
            self.ledgers
                .refresh_capacity(&self.config.node_name, report.size_gib(), report.free_gib())
                .await?;
        }
        Ok(())
    }

    /// Run the controller until shutdown. Triggers: changes to this
    /// node's ledger, changes to any volume pinned to this node, and the
    /// periodic resync.
    pub async fn run(self) -> Result<()> {
        let ledgers: Api<CapacityLedger> = Api::all(self.client.clone());
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let node = self.config.node_name.clone();

        Controller::new(ledgers, watcher::Config::default())
            .watches(volumes, watcher::Config::default(), move |pv| {
                pv_on_node(&pv, &node).then(|| ObjectRef::new(&node))
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(self))
            .for_each(|result| async move {
                match result {
                    Ok((ledger, _)) => debug!("reconciled capacity ledger {}", ledger.name),
                    Err(e) => warn!("capacity reconcile failed: {}", e),
                }
            })
            .await;
        Ok(())
    }

    /// Claims whose volume is pinned to this node, bound, and published —
    /// their usage is part of the volume group's free capacity now, so any
    /// reservation they still hold must be retired
    async fn bound_claims(&self) -> Result<BTreeSet<String>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = volumes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter(|pv| {
                pv_on_node(pv, &self.config.node_name) && pv_is_bound(pv) && pv_is_published(pv)
            })
            .filter_map(pv_claim_key)
            .collect())
    }
}

// =============================================================================
// Reconcile
// =============================================================================

async fn reconcile(
    ledger: Arc<CapacityLedger>,
    ctx: Arc<CapacityReconciler>,
) -> Result<Action> {
    // ledgers of other nodes are not this agent's concern
    if ledger.node_name() != ctx.config.node_name {
        return Ok(Action::await_change());
    }

    let device = ctx.device.clone();
    let report = tokio::task::spawn_blocking(move || device.volume_group())
        .await
        .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;
    let Some(report) = report else {
        // startup transient: the bootstrap has not created the group yet
        info!(
            "volume group not present on {}, skipping refresh",
            ctx.config.node_name
        );
        return Ok(Action::requeue(ctx.config.resync_interval));
    };

    let bound = ctx.bound_claims().await?;

    match sync_ledger(&ctx.ledgers, &ctx.config.node_name, &report, &bound).await {
        Ok(UpdateOutcome::Updated(stored)) => {
            info!(
                "ledger {} refreshed: total={}GiB free={}GiB reservations={}",
                ctx.config.node_name,
                stored.total_capacity(),
                stored.free_capacity(),
                stored.reservations().len()
            );
        }
        Ok(UpdateOutcome::Unchanged) => {
            debug!("ledger {} unchanged", ctx.config.node_name);
        }
        Err(Error::LedgerMissing { node }) => {
            // startup transient: registration has not landed yet
            info!("no ledger registered for {} yet", node);
        }
        Err(e) => return Err(e),
    }

    Ok(Action::requeue(ctx.config.resync_interval))
}

fn error_policy(
    _ledger: Arc<CapacityLedger>,
    err: &Error,
    _ctx: Arc<CapacityReconciler>,
) -> Action {
    warn!("capacity reconcile error: {}", err);
    requeue_for(err)
}

// =============================================================================
// Ledger Synchronization
// =============================================================================

/// One read-modify-write combining the capacity refresh with the prune of
/// reservations now reflected in the free capacity
pub(crate) async fn sync_ledger<C: LedgerClient>(
    ledgers: &LedgerStore<C>,
    node: &str,
    report: &VgReport,
    bound: &BTreeSet<String>,
) -> Result<UpdateOutcome> {
    ledgers
        .modify_status(node, |status| {
            apply_observation(status, report.size_gib(), report.free_gib(), bound)
        })
        .await
}

/// Fold an observation of ground truth into the ledger status; returns
/// whether anything changed
pub(crate) fn apply_observation(
    status: &mut CapacityLedgerStatus,
    total_gib: u64,
    free_gib: u64,
    bound: &BTreeSet<String>,
) -> bool {
    let mut changed = status.record_capacity(total_gib, free_gib);
    for key in bound {
        changed |= status.release(key);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::FakeLedgerClient;
    use crate::volumes::GIB;
    use std::sync::atomic::Ordering;

    fn report(total_gib: u64, free_gib: u64) -> VgReport {
        VgReport {
            name: "localvolume-vg".into(),
            size_bytes: total_gib * GIB,
            free_bytes: free_gib * GIB,
            pv_count: 1,
        }
    }

    #[test]
    fn test_apply_observation_refresh_and_prune() {
        let mut status = CapacityLedgerStatus {
            total_capacity: 100,
            free_capacity: 50,
            ..Default::default()
        };
        status.reserve("default/data-0");
        status.reserve("default/data-1");

        let bound: BTreeSet<String> = ["default/data-0".to_string()].into();
        assert!(apply_observation(&mut status, 100, 45, &bound));

        assert_eq!(status.free_capacity, 45);
        assert!(!status.reservations.contains("default/data-0"));
        assert!(status.reservations.contains("default/data-1"));
    }

    #[test]
    fn test_apply_observation_no_change() {
        let mut status = CapacityLedgerStatus {
            total_capacity: 100,
            free_capacity: 50,
            ..Default::default()
        };
        // bound claim without a reservation changes nothing
        let bound: BTreeSet<String> = ["default/other".to_string()].into();
        assert!(!apply_observation(&mut status, 100, 50, &bound));
    }

    #[tokio::test]
    async fn test_reservation_round_trip_releases_exactly_once() {
        let ledgers = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus {
                total_capacity: 100,
                free_capacity: 100,
                ..Default::default()
            },
        ));

        // scheduler reserves at bind time
        ledgers.reserve("node-a", "default/data-0").await.unwrap();

        // agent observes the claim bound and the usage reflected
        let bound: BTreeSet<String> = ["default/data-0".to_string()].into();
        let outcome = sync_ledger(&ledgers, "node-a", &report(100, 95), &bound)
            .await
            .unwrap();
        assert!(!outcome.is_unchanged());

        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.reservations().is_empty());
        assert_eq!(ledger.free_capacity(), 95);

        // the next observation is a no-op write: no double release
        let writes = ledgers_writes(&ledgers);
        let outcome = sync_ledger(&ledgers, "node-a", &report(100, 95), &bound)
            .await
            .unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(ledgers_writes(&ledgers), writes);
    }

    #[tokio::test]
    async fn test_sync_missing_ledger_reports_transient() {
        let ledgers = LedgerStore::new(FakeLedgerClient::empty());
        let err = sync_ledger(&ledgers, "node-a", &report(10, 10), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LedgerMissing { .. }));
    }

    #[tokio::test]
    async fn test_sync_preserves_invariant() {
        let ledgers = LedgerStore::new(FakeLedgerClient::with_ledger(
            "node-a",
            CapacityLedgerStatus::default(),
        ));
        // a racing allocation can make free read higher than total
        sync_ledger(&ledgers, "node-a", &report(10, 12), &BTreeSet::new())
            .await
            .unwrap();
        let ledger = ledgers.get("node-a").await.unwrap().unwrap();
        assert!(ledger.free_capacity() <= ledger.total_capacity());
    }

    fn ledgers_writes(store: &LedgerStore<FakeLedgerClient>) -> u32 {
        store.client().writes.load(Ordering::SeqCst)
    }
}
