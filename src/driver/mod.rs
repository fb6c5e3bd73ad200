//! CSI driver services
//!
//! The device-provisioning gRPC endpoint served to the kubelet over a
//! local Unix socket: identity (plugin handshake), controller (topology
//! resolution, no device side effects) and node (the real volume
//! lifecycle: create, format, mount, grow, delete).

pub mod proto {
    tonic::include_proto!("csi.v1");
}

mod catalog;
mod controller;
mod identity;
mod node;

pub use catalog::{KubeVolumeCatalog, VolumeCatalog};
pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::constants::{DEFAULT_FS_TYPE, DRIVER_NAME};
use crate::error::{Error, Result};
use crate::lvm::DeviceOps;

use proto::controller_server::ControllerServer;
use proto::identity_server::IdentityServer;
use proto::node_server::NodeServer;

// =============================================================================
// Configuration
// =============================================================================

/// Immutable driver configuration shared by the three services
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Plugin name reported to the orchestrator
    pub driver_name: String,
    /// Plugin version reported to the orchestrator
    pub driver_version: String,
    /// Node this driver instance runs on
    pub node_name: String,
    /// Socket endpoint, e.g. `unix:///csi/csi.sock`
    pub endpoint: String,
    /// Filesystem used when a claim does not name one
    pub default_fs_type: String,
}

impl DriverConfig {
    pub fn new(node_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            driver_name: DRIVER_NAME.to_string(),
            driver_version: crate::VERSION.to_string(),
            node_name: node_name.into(),
            endpoint: endpoint.into(),
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
        }
    }
}

// =============================================================================
// Per-Volume Locks
// =============================================================================

/// Guards against concurrent lifecycle calls for the same volume; distinct
/// volumes proceed in parallel under the host tooling's own locking
#[derive(Default)]
pub struct VolumeLocks {
    inflight: parking_lot::Mutex<BTreeSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the in-flight slot for a volume; `None` when an operation for
    /// the same volume is already running
    pub fn try_acquire(self: &Arc<Self>, volume_id: &str) -> Option<VolumeLockGuard> {
        let mut inflight = self.inflight.lock();
        if !inflight.insert(volume_id.to_string()) {
            return None;
        }
        Some(VolumeLockGuard {
            locks: self.clone(),
            volume_id: volume_id.to_string(),
        })
    }
}

/// Releases the volume's in-flight slot on drop
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    volume_id: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.inflight.lock().remove(&self.volume_id);
    }
}

// =============================================================================
// Driver Server
// =============================================================================

/// Serves the identity, controller and node services over a Unix socket
pub struct DriverServer {
    config: DriverConfig,
    device: Arc<dyn DeviceOps>,
    catalog: Arc<dyn VolumeCatalog>,
}

impl DriverServer {
    pub fn new(
        config: DriverConfig,
        device: Arc<dyn DeviceOps>,
        catalog: Arc<dyn VolumeCatalog>,
    ) -> Self {
        Self {
            config,
            device,
            catalog,
        }
    }

    /// Bind the endpoint and serve until the process stops
    pub async fn run(self) -> Result<()> {
        let socket_path = endpoint_socket_path(&self.config.endpoint)?;
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        let incoming = UnixListenerStream::new(listener);

        let identity = IdentityService::new(self.config.clone());
        let controller = ControllerService::new(self.config.clone());
        let node = NodeService::new(self.config.clone(), self.device, self.catalog);

        info!(
            "driver {} v{} serving on node {} at {}",
            self.config.driver_name,
            self.config.driver_version,
            self.config.node_name,
            socket_path.display()
        );

        Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(ControllerServer::new(controller))
            .add_service(NodeServer::new(node))
            .serve_with_incoming(incoming)
            .await
            .map_err(|e| Error::Internal(format!("gRPC server failed: {}", e)))?;
        Ok(())
    }
}

/// Resolve a CSI endpoint string to a socket path
fn endpoint_socket_path(endpoint: &str) -> Result<PathBuf> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.starts_with('/') {
            return Ok(PathBuf::from(path));
        }
    } else if endpoint.starts_with('/') {
        return Ok(PathBuf::from(endpoint));
    }
    Err(Error::InvalidArgument(format!(
        "endpoint must be an absolute unix socket path: {}",
        endpoint
    )))
}
