//! camdeploy Agent - local camera discovery and provisioning service
//!
//! Serves the device proxy, scan and deployment APIs on a loopback port for
//! browser-based front ends. One instance per user.

mod lockfile;
mod server;

use anyhow::{Context, Result};
use camdeploy_core::config;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "camdeploy-agent")]
#[command(version)]
#[command(about = "camdeploy Agent - Local camera discovery and provisioning service")]
pub struct Args {
    /// Config file (defaults to ~/.config/camdeploy/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides config and CAMDEPLOY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides config and CAMDEPLOY_BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "camdeploy_agent={0},camdeploy_core={0},security=warn,tower_http=info",
                    log_level
                )
                .into()
            }),
        )
        .init();

    info!("Starting camdeploy Agent v{}", env!("CARGO_PKG_VERSION"));

    let _lock = lockfile::InstanceLock::acquire()?;

    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.service.port = port;
    }
    if let Some(bind) = args.bind {
        config.service.bind = bind;
    }
    info!(
        "Configuration from {}; certificate pin policy: {}",
        config.source, config.tls.pin_policy
    );

    let addr: SocketAddr = format!("{}:{}", config.service.bind, config.service.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.service.bind, config.service.port
            )
        })?;

    let stack = config.device_stack()?;
    let state = server::AppState::new(config, stack)?;
    let eviction = state.spawn_eviction();
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    eviction.abort();
    info!("camdeploy Agent stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
