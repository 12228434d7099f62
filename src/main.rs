use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::grpc::GrpcServer;
use turnstile::mesh::Cluster;
use turnstile::ratelimit::{AdmissionEngine, PenaltyEngine, RuleTable};
use turnstile::store::{ClusterStore, CounterStore, FailoverStore, LocalStore};

/// Request admission-control service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the service configuration file
    #[arg(long)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        grpc_addr = %config.server.grpc_addr,
        failure_mode = config.failover.mode.as_str(),
        "Configuration loaded"
    );

    // Invalid rules abort startup
    let rules = RuleTable::from_file(&config.rules_path)
        .with_context(|| format!("loading rules from {}", config.rules_path.display()))?;
    info!(rules = rules.rule_count(), "Rule table loaded");

    let cluster = Arc::new(Cluster::start(config.cluster.clone()).await?);
    info!(node_id = %cluster.node_id(), "Cluster node started");

    let primary: Arc<dyn CounterStore> =
        Arc::new(ClusterStore::new(cluster.clone(), config.store.min_live_nodes));
    let fallback: Arc<dyn CounterStore> = Arc::new(LocalStore::new());
    let store = Arc::new(FailoverStore::new(
        primary,
        Some(fallback),
        config.failover.clone(),
    ));

    let engine = Arc::new(AdmissionEngine::new(
        rules,
        PenaltyEngine::new(config.penalty.clone()),
        store,
    ));
    info!("Admission engine initialized");

    let sweeper = engine.clone().spawn_sweeper(config.server.sweep_interval);

    // Run the server with graceful shutdown on Ctrl+C
    let grpc_server = GrpcServer::new(
        config.server.grpc_addr,
        engine.clone(),
        config.rules_path.clone(),
    );
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    let _ = sweeper.await;
    drop(engine);

    match Arc::try_unwrap(cluster) {
        Ok(cluster) => cluster.shutdown().await?,
        Err(_) => warn!("Cluster still referenced at shutdown, skipping graceful leave"),
    }

    info!("Turnstile Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
