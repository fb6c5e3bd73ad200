//! Controller service: topology-only volume creation
//!
//! Creating a volume is a pure metadata decision here: resolve the target
//! node from the claim's topology requirement and stamp it into the
//! returned volume. The logical volume itself is created by the first
//! publish on that node, and deletion belongs to the reclaimer, so both
//! `DeleteVolume` and the standalone expand call are deliberate no-ops.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::info;

use super::proto;
use super::DriverConfig;
use crate::constants::TOPOLOGY_NODE_KEY;
use proto::controller_server::Controller;
use proto::controller_service_capability;

/// Controller-side CSI endpoints
pub struct ControllerService {
    config: DriverConfig,
}

impl ControllerService {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name cannot be empty"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities cannot be empty",
            ));
        }
        let Some(node) = pick_node(req.accessibility_requirements.as_ref()) else {
            return Err(Status::invalid_argument(
                "no node resolvable from topology requirement",
            ));
        };

        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0);

        info!(
            "create volume {} for node {} size {}",
            req.name, node, capacity_bytes
        );

        let mut segments = HashMap::new();
        segments.insert(TOPOLOGY_NODE_KEY.to_string(), node);

        Ok(Response::new(proto::CreateVolumeResponse {
            volume: Some(proto::Volume {
                volume_id: req.name,
                capacity_bytes,
                volume_context: req.parameters,
                accessible_topology: vec![proto::Topology { segments }],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        // the reclaimer on the owning node deletes the device once the
        // volume is released
        info!("delete volume {} acknowledged", request.into_inner().volume_id);
        Ok(Response::new(proto::DeleteVolumeResponse {}))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = [
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
        ]
        .into_iter()
        .map(|rpc_type| proto::ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        })
        .collect();

        Ok(Response::new(proto::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<proto::ControllerExpandVolumeRequest>,
    ) -> Result<Response<proto::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id cannot be empty"));
        }
        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0);

        // growth happens inside the next publish on the owning node
        info!(
            "expand volume {} to {} deferred to node publish",
            req.volume_id, capacity_bytes
        );
        Ok(Response::new(proto::ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: true,
        }))
    }
}

/// Resolve the target node from a topology requirement: preferred entries
/// first, then requisite
fn pick_node(requirement: Option<&proto::TopologyRequirement>) -> Option<String> {
    let requirement = requirement?;
    requirement
        .preferred
        .iter()
        .chain(requirement.requisite.iter())
        .find_map(|topology| topology.segments.get(TOPOLOGY_NODE_KEY).cloned())
}
