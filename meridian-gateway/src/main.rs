//! # Meridian Gateway Binary
//!
//! Loads configuration, builds the dispatch core, and serves the axum
//! router until interrupted. Also spawns the background health-check sweep
//! (`HealthTracker::spawn_background_sweep`) so circuit breakers recover
//! from `Open` even on an otherwise idle gateway, plus a config hot-reload
//! task that polls the config file's mtime and atomically swaps a rebuilt
//! `AppState` into the router's `SharedState` handle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meridian_gateway::config::Config;
use meridian_gateway::server::{create_server_with_handle, AppState, SharedState};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Overrides `server.port` from the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Overrides `server.host` from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `logging.level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Disables the config-file hot-reload poller.
    #[arg(long)]
    no_reload: bool,

    /// How often to check the config file for changes.
    #[arg(long, default_value = "5")]
    reload_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(&config.logging.level)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(&config.logging.level).init();
    }

    let state = AppState::build(Arc::new(config.clone()))?;
    state.dispatch.health().spawn_background_sweep();

    let (shared, app) = create_server_with_handle(state);

    if !args.no_reload {
        spawn_reload_task(shared, PathBuf::from(&args.config), Duration::from_secs(args.reload_interval_secs));
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(%addr, providers = ?config.providers.keys().collect::<Vec<_>>(), "starting meridian gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Polls `path`'s mtime every `interval` and, on change, reloads, validates,
/// and rebuilds the dispatch core, swapping it into `shared` only once the
/// new config passes validation. A bad edit logs and leaves the previous
/// config serving traffic rather than taking the gateway down.
fn spawn_reload_task(shared: SharedState, path: PathBuf, interval: Duration) {
    tokio::spawn(async move {
        let mut last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "could not stat config file for reload");
                    continue;
                }
            };

            if last_modified == Some(modified) {
                continue;
            }
            last_modified = Some(modified);

            match Config::reload_from(&path) {
                Ok(new_config) => match shared.current().reload(Arc::new(new_config)) {
                    Ok(next_state) => {
                        shared.swap(next_state);
                        tracing::info!(path = %path.display(), "configuration reloaded");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "rebuilding dispatch core from reloaded config failed, keeping previous state");
                    }
                },
                Err(err) => {
                    tracing::error!(error = %err, path = %path.display(), "reloaded config failed validation, keeping previous state");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
