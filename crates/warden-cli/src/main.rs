mod commands;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_lock::store::RedisStore;
use warden_lock::LockManager;
use warden_resilience::retry;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries tokens and status output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let store = connect(&config).await?;
    let manager = LockManager::with_config(Arc::new(store), config.lock_config());

    let shutdown = create_shutdown_signal();
    let code = commands::run(&config, &manager, shutdown).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Connect to Redis, retrying while the server is unreachable.
async fn connect(config: &Config) -> anyhow::Result<RedisStore> {
    let options = config.connect_options();
    retry::execute_with_notify(
        &options,
        || RedisStore::connect(&config.redis_url),
        |attempt, err| {
            warn!(
                "Redis connection attempt {}/{} failed: {}",
                attempt, options.max_attempts, err
            )
        },
    )
    .await
    .context("Failed to connect to Redis")
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
