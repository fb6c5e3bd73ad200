//! Scheduler extender binary
//!
//! Serves the predicate/prioritize/bind/preemption webhooks kube-scheduler
//! is configured with, backed by the per-node capacity ledgers.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use local_volume_operator::constants::DRIVER_NAME;
use local_volume_operator::scheduler::{extender_router, PlacementEngine, SchedulerConfig};
use local_volume_operator::{logging, Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local volume scheduler extender
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extender listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Provisioner name qualifying claims for capacity accounting
    #[arg(long, env = "DRIVER_NAME", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Name segment of the predicate route
    #[arg(long, env = "PREDICATE_NAME", default_value = "local-capacity")]
    predicate_name: String,

    /// Name segment of the priority route
    #[arg(long, env = "PRIORITY_NAME", default_value = "capacity-spread")]
    priority_name: String,

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

    info!("Starting local volume scheduler extender");
    info!("  Version: {}", local_volume_operator::VERSION);
    info!("  Listen: {}", args.listen_addr);
    info!("  Driver: {}", args.driver_name);

    // unreachable cluster API is fatal: an extender answering from stale
    // guesses would corrupt placement
    let client = kube::Client::try_default()
        .await
        .map_err(local_volume_operator::Error::Kube)?;

    let config = SchedulerConfig {
        driver_name: args.driver_name,
        predicate_name: args.predicate_name,
        priority_name: args.priority_name,
    };
    let engine = Arc::new(PlacementEngine::new(client, config));

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let addr: SocketAddr = args
        .listen_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid listen address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Extender listening on {}", addr);

    axum::serve(listener, extender_router(engine)).await?;

    info!("Scheduler extender shutdown complete");
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

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register extender metrics
    let _ = prometheus::register_counter!(
        "local_volume_extender_predicate_total",
        "Total number of predicate calls"
    );
    let _ = prometheus::register_counter!(
        "local_volume_extender_bind_total",
        "Total number of bind calls"
    );
    let _ = prometheus::register_counter_vec!(
        "local_volume_extender_bind_failures",
        "Bind failures by reason",
        &["reason"]
    );
    let _ = prometheus::register_histogram!(
        "local_volume_extender_predicate_duration_seconds",
        "Duration of predicate evaluations"
    );

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
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
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
