//! CubeFS Operator
//!
//! Watches StorageCluster and StorageMonitor resources and converges each
//! declared cluster into running workloads through dependency-ordered,
//! idempotent synthesis passes.

use clap::Parser;
use dashmap::DashMap;
use kube::{Api, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cubefs_operator::{
    csi_enabled_from_env, run_worker_pool, watch_resource, ClusterReconciler, DefaultTable,
    Error, MonitorReconciler, Result, StorageCluster, StorageMonitor, WorkQueue,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CubeFS Operator - Declarative Storage Cluster Control Plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of cluster reconciliation workers
    #[arg(long, env = "CLUSTER_WORKERS", default_value = "1")]
    cluster_workers: usize,

    /// Number of monitor reconciliation workers
    #[arg(long, env = "MONITOR_WORKERS", default_value = "1")]
    monitor_workers: usize,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

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

    // Initialize logging
    init_logging(&args);

    let csi_enabled = csi_enabled_from_env();

    info!("Starting CubeFS Operator");
    info!("  Version: {}", cubefs_operator::VERSION);
    info!("  Cluster workers: {}", args.cluster_workers);
    info!("  Monitor workers: {}", args.monitor_workers);
    info!("  CSI provisioner chain: {}", csi_enabled);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let defaults = DefaultTable::default();
    let token = CancellationToken::new();

    // Cluster controller
    let cluster_queue = WorkQueue::new();
    let cluster_observed = Arc::new(DashMap::new());
    let cluster_api: Api<StorageCluster> = Api::all(client.clone());
    tokio::spawn(watch_resource(
        cluster_api,
        cluster_queue.clone(),
        cluster_observed,
        token.clone(),
    ));
    let cluster_pool = tokio::spawn(run_worker_pool(
        "cluster",
        cluster_queue,
        Arc::new(ClusterReconciler::new(
            client.clone(),
            defaults.clone(),
            csi_enabled,
        )),
        args.cluster_workers,
        token.clone(),
    ));

    // Monitor controller
    let monitor_queue = WorkQueue::new();
    let monitor_observed = Arc::new(DashMap::new());
    let monitor_api: Api<StorageMonitor> = Api::all(client.clone());
    tokio::spawn(watch_resource(
        monitor_api,
        monitor_queue.clone(),
        monitor_observed,
        token.clone(),
    ));
    let monitor_pool = tokio::spawn(run_worker_pool(
        "monitor",
        monitor_queue,
        Arc::new(MonitorReconciler::new(client, defaults)),
        args.monitor_workers,
        token.clone(),
    ));

    info!("Controllers started");

    // Cooperative shutdown: drain the queues, let in-flight passes finish
    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received, draining");
    token.cancel();

    let _ = cluster_pool.await;
    let _ = monitor_pool.await;

    info!("Operator shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
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
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                "/readyz" => Response::builder()
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
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

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

    // Register operator metrics
    let _ = prometheus::register_counter!(
        "cubefs_operator_reconcile_passes_total",
        "Total number of reconciliation passes"
    );
    let _ = prometheus::register_counter_vec!(
        "cubefs_operator_reconcile_failures_total",
        "Reconciliation failures by controller",
        &["controller"]
    );
    let _ = prometheus::register_histogram!(
        "cubefs_operator_reconcile_duration_seconds",
        "Duration of reconciliation passes"
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
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
