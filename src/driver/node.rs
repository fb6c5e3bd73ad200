//! Node service: the volume lifecycle state machine
//!
//! Publish drives a device through
//! `Absent -> Provisioned -> Formatted -> Mounted -> [Resized]*`, each
//! step skipped when ground truth says it already happened, so retried
//! calls converge instead of erroring:
//!
//! - the device is created only if its node is absent
//! - a device carrying any filesystem signature is never reformatted
//! - mounting is skipped when the target is already a mount point
//! - growth is one-directional and only applies to pre-existing devices
//!
//! Unpublish unmounts and deletes the device. Staging and the standalone
//! expand call are no-ops: volumes are single-node and growth happens
//! inside publish.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use super::proto;
use super::{DriverConfig, VolumeCatalog, VolumeLocks};
use crate::constants::{ALLOCATION_TAG, FS_TYPE_TAG, TOPOLOGY_NODE_KEY};
use crate::error::{Error, Result};
use crate::lvm::{DeviceOps, SizeSpec, VolumeLayout};
use proto::node_server::Node;
use proto::{node_service_capability, volume_capability};

// =============================================================================
// Node Service
// =============================================================================

/// Node-side CSI endpoints backed by the device command layer
pub struct NodeService {
    config: DriverConfig,
    device: Arc<dyn DeviceOps>,
    catalog: Arc<dyn VolumeCatalog>,
    locks: Arc<VolumeLocks>,
}

impl NodeService {
    pub fn new(
        config: DriverConfig,
        device: Arc<dyn DeviceOps>,
        catalog: Arc<dyn VolumeCatalog>,
    ) -> Self {
        Self {
            config,
            device,
            catalog,
            locks: VolumeLocks::new(),
        }
    }

    async fn publish(&self, req: proto::NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id cannot be empty".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path cannot be empty".into()));
        }
        let _guard =
            self.locks
                .try_acquire(&req.volume_id)
                .ok_or_else(|| Error::OperationPending {
                    volume_id: req.volume_id.clone(),
                })?;

        let params = PublishParams {
            volume_id: req.volume_id.clone(),
            target: PathBuf::from(&req.target_path),
            fs_type: req
                .volume_context
                .get(FS_TYPE_TAG)
                .cloned()
                .unwrap_or_else(|| self.config.default_fs_type.clone()),
            layout: match req.volume_context.get(ALLOCATION_TAG) {
                Some(value) => value.parse()?,
                None => VolumeLayout::default(),
            },
            requested_bytes: self.catalog.requested_bytes(&req.volume_id).await?,
            read_only: req.readonly,
            mount_flags: mount_flags(&req),
        };

        let device = self.device.clone();
        tokio::task::spawn_blocking(move || publish_device(device.as_ref(), &params))
            .await
            .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;

        self.catalog.mark_published(&req.volume_id).await?;
        info!(
            "published volume {} at {} on node {}",
            req.volume_id, req.target_path, self.config.node_name
        );
        Ok(())
    }

    async fn unpublish(&self, req: proto::NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id cannot be empty".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path cannot be empty".into()));
        }
        let _guard =
            self.locks
                .try_acquire(&req.volume_id)
                .ok_or_else(|| Error::OperationPending {
                    volume_id: req.volume_id.clone(),
                })?;

        let device = self.device.clone();
        let volume_id = req.volume_id.clone();
        let target = PathBuf::from(&req.target_path);
        tokio::task::spawn_blocking(move || unpublish_device(device.as_ref(), &volume_id, &target))
            .await
            .map_err(|e| Error::Internal(format!("device task panicked: {}", e)))??;

        info!(
            "unpublished volume {} from {} on node {}",
            req.volume_id, req.target_path, self.config.node_name
        );
        Ok(())
    }
}

// =============================================================================
// Publish / Unpublish State Machine
// =============================================================================

struct PublishParams {
    volume_id: String,
    target: PathBuf,
    fs_type: String,
    layout: VolumeLayout,
    requested_bytes: u64,
    read_only: bool,
    mount_flags: Vec<String>,
}

fn publish_device(device: &dyn DeviceOps, params: &PublishParams) -> Result<()> {
    let id = &params.volume_id;

    let newly_created = !device.volume_exists(id);
    if newly_created {
        device.create_volume(id, SizeSpec::from_bytes(params.requested_bytes), params.layout)?;
    }

    if !params.target.exists() {
        std::fs::create_dir_all(&params.target)?;
    }

    // format only a blank device: an existing signature means data
    if device.probe_filesystem(id)?.is_none() {
        device.format_volume(id, &params.fs_type)?;
    }

    if !device.is_mounted(&params.target)? {
        let mut options = vec![if params.read_only { "ro" } else { "rw" }.to_string()];
        options.extend(params.mount_flags.iter().cloned());
        device.mount_volume(id, &params.target, &params.fs_type, &options)?;
    }

    // a pre-existing device may carry a grown claim; shrinking never happens
    if !newly_created {
        if let Some(current) = device.volume_size_bytes(id)? {
            let wanted = SizeSpec::from_bytes(params.requested_bytes);
            if wanted.bytes() > current {
                device.extend_volume(id, wanted)?;
                device.resize_filesystem(id, &params.target)?;
            }
        }
    }
    Ok(())
}

fn unpublish_device(device: &dyn DeviceOps, volume_id: &str, target: &Path) -> Result<()> {
    if !target.exists() {
        return Err(Error::TargetNotFound {
            path: target.display().to_string(),
        });
    }

    let was_mounted = device.is_mounted(target)?;
    if was_mounted {
        device.unmount(target)?;
    }

    if device.volume_exists(volume_id) {
        device.remove_volume(volume_id)?;
    } else if was_mounted {
        // a mounted device must exist; its absence means the mount table
        // and the volume group disagree
        return Err(Error::Internal(format!(
            "device for mounted volume {} is absent",
            volume_id
        )));
    }
    Ok(())
}

fn mount_flags(req: &proto::NodePublishVolumeRequest) -> Vec<String> {
    req.volume_capability
        .as_ref()
        .and_then(|capability| capability.access_type.as_ref())
        .and_then(|access| match access {
            volume_capability::AccessType::Mount(mount) => Some(mount.mount_flags.clone()),
            volume_capability::AccessType::Block(_) => None,
        })
        .unwrap_or_default()
}

// =============================================================================
// CSI Trait
// =============================================================================

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<proto::NodePublishVolumeResponse>, Status> {
        self.publish(request.into_inner()).await?;
        Ok(Response::new(proto::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        self.unpublish(request.into_inner()).await?;
        Ok(Response::new(proto::NodeUnpublishVolumeResponse {}))
    }

    async fn node_stage_volume(
        &self,
        _request: Request<proto::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<proto::NodeStageVolumeResponse>, Status> {
        // single-node volumes need no staging phase
        Ok(Response::new(proto::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<proto::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<proto::NodeUnstageVolumeResponse>, Status> {
        Ok(Response::new(proto::NodeUnstageVolumeResponse {}))
    }

    async fn node_expand_volume(
        &self,
        request: Request<proto::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<proto::NodeExpandVolumeResponse>, Status> {
        // growth happens inside publish; acknowledge without acting
        let req = request.into_inner();
        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0);
        Ok(Response::new(proto::NodeExpandVolumeResponse {
            capacity_bytes,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = [
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::ExpandVolume,
        ]
        .into_iter()
        .map(|rpc_type| proto::NodeServiceCapability {
            r#type: Some(node_service_capability::Type::Rpc(
                node_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        })
        .collect();

        Ok(Response::new(proto::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<proto::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<proto::NodeGetInfoResponse>, Status> {
        let mut segments = std::collections::HashMap::new();
        segments.insert(
            TOPOLOGY_NODE_KEY.to_string(),
            self.config.node_name.clone(),
        );

        Ok(Response::new(proto::NodeGetInfoResponse {
            node_id: self.config.node_name.clone(),
            max_volumes_per_node: 0,
            // volumes served here are reachable from this node only
            accessible_topology: Some(proto::Topology { segments }),
        }))
    }
}
