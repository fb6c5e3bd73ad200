//! Identity service: plugin handshake

use tonic::{Request, Response, Status};

use super::proto;
use super::DriverConfig;
use proto::identity_server::Identity;
use proto::plugin_capability;

/// Reports the plugin's name, version and capability set
pub struct IdentityService {
    config: DriverConfig,
}

impl IdentityService {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        if self.config.driver_name.is_empty() {
            return Err(Status::unavailable("driver name not configured"));
        }
        if self.config.driver_version.is_empty() {
            return Err(Status::unavailable("driver version not configured"));
        }

        Ok(Response::new(proto::GetPluginInfoResponse {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.driver_version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<proto::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<proto::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![
            service_capability(plugin_capability::service::Type::ControllerService),
            service_capability(plugin_capability::service::Type::VolumeAccessibilityConstraints),
            proto::PluginCapability {
                r#type: Some(plugin_capability::Type::VolumeExpansion(
                    plugin_capability::VolumeExpansion {
                        r#type: plugin_capability::volume_expansion::Type::Offline as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(proto::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn probe(
        &self,
        _request: Request<proto::ProbeRequest>,
    ) -> Result<Response<proto::ProbeResponse>, Status> {
        Ok(Response::new(proto::ProbeResponse { ready: true }))
    }
}

fn service_capability(service_type: plugin_capability::service::Type) -> proto::PluginCapability {
    proto::PluginCapability {
        r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
            r#type: service_type as i32,
        })),
    }
}
