//! CSI driver binary
//!
//! Serves the identity, controller and node services over the kubelet's
//! plugin socket on this node.

use clap::Parser;
use std::sync::Arc;
use tracing::info;

use local_volume_operator::constants::{DEFAULT_FS_TYPE, DEFAULT_VG_NAME, DRIVER_NAME};
use local_volume_operator::driver::{DriverConfig, DriverServer, KubeVolumeCatalog};
use local_volume_operator::lvm::{DeviceOps, HostLvm, LvmConfig};
use local_volume_operator::{logging, Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local volume CSI driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this driver runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Plugin socket endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Plugin name reported to the orchestrator
    #[arg(long, env = "DRIVER_NAME", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Name of the node volume group
    #[arg(long, env = "VG_NAME", default_value = DEFAULT_VG_NAME)]
    vg_name: String,

    /// Device path prefix scanned when bootstrapping the volume group
    #[arg(long, env = "DEVICE_PREFIX", default_value = "/dev/vd")]
    device_prefix: String,

    /// Run device commands in this process's own mount namespace instead
    /// of the host's (for development environments)
    #[arg(long, env = "NO_HOST_NAMESPACE")]
    no_host_namespace: bool,

    /// Filesystem used when a claim does not name one
    #[arg(long, env = "DEFAULT_FS_TYPE", default_value = DEFAULT_FS_TYPE)]
    default_fs_type: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    info!("Starting local volume CSI driver");
    info!("  Version: {}", local_volume_operator::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Endpoint: {}", args.endpoint);

    let client = kube::Client::try_default().await.map_err(Error::Kube)?;

    let lvm_config = LvmConfig {
        vg_name: args.vg_name,
        device_prefix: args.device_prefix,
        host_namespace: !args.no_host_namespace,
    };
    let device: Arc<dyn DeviceOps> = Arc::new(HostLvm::new(lvm_config));
    let catalog = Arc::new(KubeVolumeCatalog::new(client));

    let config = DriverConfig {
        driver_name: args.driver_name,
        driver_version: local_volume_operator::VERSION.to_string(),
        node_name: args.node_name,
        endpoint: args.endpoint,
        default_fs_type: args.default_fs_type,
    };

    DriverServer::new(config, device, catalog).run().await?;

    info!("CSI driver shutdown complete");
    Ok(())
}
