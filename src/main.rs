//! Agentgate - control plane for workspace agents behind NAT
//!
//! Serves the agent and client APIs, brokers tunnels between them and keeps
//! the daily active user metrics warm.

use agentgate_api::{serve, ServerState};
use agentgate_broker::{MemoryPubsub, RelayServer};
use agentgate_control::{ControlConfig, ControlPlane};
use agentgate_metrics_cache::{Cache, CacheOptions};
use agentgate_relay_db::{connect, migrate, DbStore, Store};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("AGENTGATE_VERSION"),
    " (",
    env!("AGENTGATE_COMMIT"),
    ", built ",
    env!("AGENTGATE_BUILD_TIME"),
    ")"
);

/// Agentgate - broker tunnels to workspace agents
#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(version = VERSION)]
struct Cli {
    /// Address to serve the API on
    #[arg(long, env = "AGENTGATE_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Database connection URL (sqlite or postgres)
    #[arg(
        long,
        env = "AGENTGATE_DATABASE_URL",
        default_value = "sqlite://agentgate.db?mode=rwc"
    )]
    database_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("Agentgate {} starting...", VERSION);

    let db = connect(&cli.database_url)
        .await
        .with_context(|| format!("Failed to connect to database {}", cli.database_url))?;
    migrate(&db).await.context("Failed to run database migrations")?;
    let store: Arc<dyn Store> = Arc::new(DbStore::new(db));

    let config = ControlConfig::default().with_env_overrides();
    info!(
        update_frequency = ?config.agent_connection_update_frequency,
        inactive_timeout = ?config.agent_inactive_disconnect_timeout,
        stat_interval = ?config.agent_stat_interval,
        "Control plane configured"
    );
    let plane = Arc::new(ControlPlane::new(
        store.clone(),
        Arc::new(MemoryPubsub::new()),
        RelayServer::default(),
        config,
    ));

    let cache = Arc::new(Cache::new(store, CacheOptions::default().with_env_overrides()));
    cache.start();

    let listener = TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;

    let shutdown = plane.shutdown_token();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
            shutdown.cancel();
        }
    });

    let state = ServerState {
        plane: plane.clone(),
        cache: cache.clone(),
    };
    let result = serve(listener, state, shutdown).await;

    // Drain tunnels and sockets before the metrics loop goes away
    plane.shutdown().await;
    cache.close().await;

    info!("Agentgate stopped");
    result
}
