//! Volume catalog: claim metadata behind the node service
//!
//! The node service needs two things from the orchestrator: the requested
//! size of the claim backing a volume id, and a way to stamp the
//! publish-succeeded marker the capacity reconciler keys on. Both go
//! through this port so the lifecycle state machine is testable without a
//! cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::constants::PUBLISH_SUCCEEDED_ANNOTATION;
use crate::error::{Error, Result};
use crate::volumes::{pv_capacity_bytes, pv_is_published};

/// Claim metadata lookups for the node service
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    /// Requested capacity in bytes of the claim backing a volume id
    async fn requested_bytes(&self, volume_id: &str) -> Result<u64>;

    /// Stamp the publish-succeeded marker; idempotent
    async fn mark_published(&self, volume_id: &str) -> Result<()>;
}

/// [`VolumeCatalog`] reading PersistentVolumes from the cluster
pub struct KubeVolumeCatalog {
    volumes: Api<PersistentVolume>,
}

impl KubeVolumeCatalog {
    pub fn new(client: Client) -> Self {
        Self {
            volumes: Api::all(client),
        }
    }
}

#[async_trait]
impl VolumeCatalog for KubeVolumeCatalog {
    async fn requested_bytes(&self, volume_id: &str) -> Result<u64> {
        let volume = self
            .volumes
            .get_opt(volume_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: volume_id.into(),
            })?;
        pv_capacity_bytes(&volume).ok_or_else(|| {
            Error::InvalidArgument(format!("volume {} carries no storage capacity", volume_id))
        })
    }

    async fn mark_published(&self, volume_id: &str) -> Result<()> {
        let volume = self
            .volumes
            .get_opt(volume_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: volume_id.into(),
            })?;
        if pv_is_published(&volume) {
            return Ok(());
        }

        let patch = json!({
            "metadata": {
                "annotations": {
                    PUBLISH_SUCCEEDED_ANNOTATION: "true",
                }
            }
        });
        self.volumes
            .patch(volume_id, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("stamped publish marker on volume {}", volume_id);
        Ok(())
    }
}
