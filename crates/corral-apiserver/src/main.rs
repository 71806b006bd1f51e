//! corral-apiserver - control-plane API server binary.
//!
//! Loads the TOML configuration, seeds an in-memory cluster-state store from
//! its `[[entities]]`, registers the built-in facades and serves until
//! SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use corral_apiserver::facades::{RestoreCoordinator, standard_facades};
use corral_apiserver::{ApiServer, ServerContext};
use corral_core::config::ServerConfig;
use corral_core::state::{EntityStore, InMemoryEntityStore};
use corral_core::{ControllerMode, SharedControllerMode};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// corral API server
#[derive(Parser, Debug)]
#[command(name = "corral-apiserver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file
    #[arg(short, long, default_value = "apiserver.toml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen_address: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = ServerConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(address) = args.listen_address {
        config.listen_address = address;
    }

    let store = Arc::new(InMemoryEntityStore::with_records(config.entities.clone()));
    let store: Arc<dyn EntityStore> = store;
    let mode = SharedControllerMode::new(ControllerMode::Normal);
    let restore = Arc::new(RestoreCoordinator::new(mode.clone()));
    let facades = standard_facades(Arc::clone(&store), config.controller_tag.clone(), restore)
        .context("failed to register facades")?;

    let ctx = ServerContext::from_config(&config, store, Arc::new(mode), facades)
        .context("invalid macaroon configuration")?;
    let server = ApiServer::bind(config.listen_address, Arc::new(ctx))
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;
    info!(
        address = %server.local_addr().context("listener has no local address")?,
        controller = %config.controller_tag,
        entities = config.entities.len(),
        "corral-apiserver starting"
    );

    let shutdown = server.shutdown_token();
    let serving = tokio::spawn(server.run());

    wait_for_signal().await?;
    shutdown.cancel();
    serving
        .await
        .context("server task panicked")?
        .context("server stopped with an error")?;
    Ok(())
}
