//! lvmsnapd - snapshotter daemon.

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::UnixListener;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lvmsnap::Snapshotter;
use lvmsnap::cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = cli.snapshotter_config()?;
    let snapshotter = tokio::task::spawn_blocking(move || Snapshotter::new(config)).await??;
    let snapshotter = Arc::new(snapshotter);

    if cli.addr.exists() {
        tracing::debug!(addr = %cli.addr.display(), "Removing stale socket");
        std::fs::remove_file(&cli.addr)?;
    }
    if let Some(parent) = cli.addr.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&cli.addr)?;
    tracing::info!(addr = %cli.addr.display(), "lvmsnapd listening");

    let served = lvmsnap::server::serve(listener, Arc::clone(&snapshotter), shutdown_signal()).await;

    if let Err(err) = std::fs::remove_file(&cli.addr) {
        tracing::warn!(addr = %cli.addr.display(), error = %err, "Failed to remove socket");
    }
    served?;

    match Arc::try_unwrap(snapshotter) {
        Ok(snapshotter) => tokio::task::spawn_blocking(move || snapshotter.close()).await??,
        Err(_) => tracing::warn!("Snapshotter still referenced; skipping close"),
    }

    tracing::info!("lvmsnapd stopped");
    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("lvmsnap={level}").parse()?)
        .add_directive(format!("lvmsnapd={level}").parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
