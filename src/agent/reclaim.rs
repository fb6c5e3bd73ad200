//! Volume reclaimer
//!
//! Watches volumes pinned to this node. When a volume turns `Released`
//! with a `Delete` reclaim policy, its backing logical volume is removed
//! and only then is the reclaim finalizer lifted: the object cannot be
//! garbage-collected while a device may still exist for it. Removal of an
//! already-absent device counts as success, so retried reconciles converge.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::PostParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use super::{requeue_for, AgentConfig};
use crate::constants::RECLAIM_FINALIZER;
use crate::error::{Error, Result};
use crate::lvm::DeviceOps;
use crate::volumes::{pv_awaiting_reclaim, pv_on_node};

// =============================================================================
// Volume Reclaimer
// =============================================================================

/// Per-node loop deleting the devices of released volumes
pub struct VolumeReclaimer {
    client: Client,
    config: AgentConfig,
    device: Arc<dyn DeviceOps>,
}

impl VolumeReclaimer {
    pub fn new(client: Client, config: AgentConfig, device: Arc<dyn DeviceOps>) -> Self {
        Self {
            client,
            config,
            device,
        }
    }

    /// Run the controller until shutdown
    pub async fn run(self) -> Result<()> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());

        Controller::new(volumes, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(self))
            .for_each(|result| async move {
                match result {
                    Ok((volume, _)) => debug!("reconciled volume {}", volume.name),
                    Err(e) => warn!("reclaim reconcile failed: {}", e),
                }
            })
            .await;
        Ok(())
    }
}

// =============================================================================
// Reconcile
// =============================================================================

async fn reconcile(pv: Arc<PersistentVolume>, ctx: Arc<VolumeReclaimer>) -> Result<Action> {
    if !pv_on_node(&pv, &ctx.config.node_name) || !pv_awaiting_reclaim(&pv) {
        return Ok(Action::await_change());
    }

    let Some(volume_id) = pv.metadata.name.clone() else {
        return Ok(Action::await_change());
    };

    // device removal first; the finalizer stays until this succeeds
    let device = ctx.device.clone();
    let id = volume_id.clone();
    tokio::task::spawn_blocking(move || device.remove_volume(&id))
        .await
        .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;

    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());
    let updated = without_reclaim_finalizer(&pv);
    volumes
        .replace(&volume_id, &PostParams::default(), &updated)
        .await?;

    info!(
        "reclaimed volume {} on node {}",
        volume_id, ctx.config.node_name
    );
    Ok(Action::await_change())
}

fn error_policy(_pv: Arc<PersistentVolume>, err: &Error, _ctx: Arc<VolumeReclaimer>) -> Action {
    warn!("reclaim error: {}", err);
    requeue_for(err)
}

/// Copy of the volume with the reclaim finalizer lifted
pub(crate) fn without_reclaim_finalizer(pv: &PersistentVolume) -> PersistentVolume {
    let mut updated = pv.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != RECLAIM_FINALIZER);
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvm::testing::FakeDeviceOps;
    use crate::lvm::{SizeSpec, VolumeLayout};
    use crate::volumes::GIB;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_without_reclaim_finalizer_keeps_others() {
        let mut pv = PersistentVolume::default();
        pv.metadata.finalizers = Some(vec![
            "kubernetes.io/pv-protection".to_string(),
            RECLAIM_FINALIZER.to_string(),
        ]);

        let updated = without_reclaim_finalizer(&pv);
        let finalizers = updated.metadata.finalizers.unwrap();
        assert_eq!(finalizers, vec!["kubernetes.io/pv-protection".to_string()]);
    }

    #[test]
    fn test_device_removal_idempotent() {
        let device = FakeDeviceOps::with_vg(100 * GIB, 100 * GIB);
        device
            .create_volume("pvc-1", SizeSpec::Gib(5), VolumeLayout::Linear)
            .unwrap();

        device.remove_volume("pvc-1").unwrap();
        assert!(!device.volume_exists("pvc-1"));

        // removing an already-absent device succeeds
        device.remove_volume("pvc-1").unwrap();
        assert_eq!(device.remove_calls.load(Ordering::SeqCst), 2);
    }
}
