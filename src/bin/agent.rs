//! Node agent binary
//!
//! Establishes the node volume group, registers the capacity ledger and
//! runs the capacity and reclamation reconcilers for this node.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use local_volume_operator::agent::{AgentConfig, CapacityReconciler, VolumeReclaimer};
use local_volume_operator::constants::DEFAULT_VG_NAME;
use local_volume_operator::crd::CapacityLedger;
use local_volume_operator::lvm::{DeviceOps, HostLvm, LvmConfig};
use local_volume_operator::{logging, Error, Result};

use kube::CustomResourceExt;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local volume node agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

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

    /// Ledger resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "60")]
    resync_interval_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8082")]
    health_addr: String,

    /// Print the CapacityLedger CRD manifest and exit
    #[arg(long)]
    dump_crd: bool,

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

    if args.dump_crd {
        let crd = serde_yaml::to_string(&CapacityLedger::crd())
            .map_err(|e| Error::Internal(format!("CRD serialization failed: {}", e)))?;
        println!("{}", crd);
        return Ok(());
    }

    logging::init(&args.log_level, args.log_json);

    info!("Starting local volume node agent");
    info!("  Version: {}", local_volume_operator::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Volume group: {}", args.vg_name);

    let client = kube::Client::try_default().await.map_err(Error::Kube)?;

    let lvm_config = LvmConfig {
        vg_name: args.vg_name,
        device_prefix: args.device_prefix,
        host_namespace: !args.no_host_namespace,
    };
    let device: Arc<dyn DeviceOps> = Arc::new(HostLvm::new(lvm_config));

    let config = AgentConfig {
        node_name: args.node_name,
        resync_interval: Duration::from_secs(args.resync_interval_secs),
    };

    // no volume group, no agent: running without one would advertise a
    // node that cannot host anything
    let capacity = CapacityReconciler::new(client.clone(), config.clone(), device.clone());
    capacity.bootstrap().await?;
    info!("Capacity ledger registered for node {}", config.node_name);

    let reclaimer = VolumeReclaimer::new(client, config, device);

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    tokio::try_join!(capacity.run(), reclaimer.run())?;

    info!("Node agent shutdown complete");
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}
