//! Laser control-plane binary
//!
//! Loads the declared topology, bootstraps the shard manager from the version
//! store, starts the background collectors and serves the HTTP API.

use laser_control::api::{self, ApiState};
use laser_control::cluster::{ClusterInfo, InMemoryTopology, TableInfo, TopologyProvider};
use laser_control::config::ComponentFactory;
use laser_control::drain::DrainController;
use laser_control::metrics::{ShardMetricsManager, DEFAULT_METRICS_TTL_MS};
use laser_control::shard::ShardManager;
use laser_control::status::{ShardStatusManager, DEFAULT_STATUS_TTL_MS};
use laser_control::telemetry;
use laser_control::validator::ConfigValidator;

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Laser control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP API port
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Service name used for version persistence and registry publication
    #[arg(long, env = "SERVICE_NAME", default_value = "laser")]
    service_name: String,

    /// Path to the declared-topology JSON document
    #[arg(long, env = "TOPOLOGY_FILE")]
    topology: String,

    /// Metrics collector tick in milliseconds
    #[arg(long, default_value_t = DEFAULT_METRICS_TTL_MS)]
    metrics_ttl_ms: u64,

    /// Status reconciler tick in milliseconds
    #[arg(long, default_value_t = DEFAULT_STATUS_TTL_MS)]
    status_ttl_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// On-disk topology document
#[derive(Debug, Deserialize)]
struct TopologyFile {
    cluster: ClusterInfo,
    #[serde(default)]
    tables: Vec<TableInfo>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    telemetry::init_logging(&args.log_level)?;

    info!(service = %args.service_name, "starting laser control plane");

    let raw = std::fs::read_to_string(&args.topology)?;
    let topology_file: TopologyFile = serde_json::from_str(&raw)?;
    let topology: Arc<InMemoryTopology> = Arc::new(InMemoryTopology::with_tables(
        topology_file.cluster.clone(),
        topology_file.tables,
    ));
    let provider: Arc<dyn TopologyProvider> = topology.clone();

    let store = ComponentFactory::create_version_store()?;

    let metrics = Arc::new(ShardMetricsManager::new(
        provider.clone(),
        args.metrics_ttl_ms,
    )?);
    let status = Arc::new(ShardStatusManager::new(metrics.clone(), args.status_ttl_ms));
    let manager = Arc::new(ShardManager::new(
        args.service_name.clone(),
        store,
        status.clone(),
    ));
    manager.update_cluster_info(&topology_file.cluster);
    manager.bootstrap().await?;

    let validator = Arc::new(ConfigValidator::new(manager.clone(), metrics.clone()));
    let drain = Arc::new(DrainController::new(provider.clone(), metrics.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_task = tokio::spawn(metrics.clone().run(shutdown_rx.clone()));
    let status_task = tokio::spawn(status.clone().run(shutdown_rx.clone()));
    let topology_task = manager.watch_topology(provider, shutdown_rx.clone());

    let router = api::build_http_router(ApiState {
        manager,
        validator,
        drain,
        metrics,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let listener = TcpListener::bind(addr).await?;
    let http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(http_port = args.http_port, "control plane ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(http_shutdown))
        .await?;

    let _ = tokio::join!(metrics_task, status_task, topology_task);
    info!("control plane shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}
