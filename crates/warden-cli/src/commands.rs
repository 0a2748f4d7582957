use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command as ProcessCommand;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warden_lock::{LockManager, LockStatus, LockToken};
use warden_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

use crate::config::{Command, Config};

/// Renewals in a row that fail on the store before `hold` stops trying.
const RENEW_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Serialize)]
struct StatusReport {
    #[serde(flatten)]
    status: LockStatus,
    checked_at: DateTime<Utc>,
}

/// Run the selected subcommand. Returns the process exit code.
pub async fn run(
    config: &Config,
    manager: &LockManager,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<i32> {
    match &config.command {
        Command::Acquire { resource, ttl } => {
            let token = acquire(config, manager, resource, *ttl).await?;
            println!("{}", token);
            Ok(0)
        }
        Command::Release { resource, token } => {
            let released = manager.release(resource, &LockToken::from(token.as_str())).await;
            println!("{}", released);
            Ok(exit_code(released))
        }
        Command::Extend {
            resource,
            token,
            ttl,
        } => {
            let extended = manager
                .extend(resource, &LockToken::from(token.as_str()), config.ttl(*ttl))
                .await;
            println!("{}", extended);
            Ok(exit_code(extended))
        }
        Command::Status { resource } => {
            let report = StatusReport {
                status: manager.status(resource).await,
                checked_at: Utc::now(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Command::Exec {
            resource,
            ttl,
            command,
        } => exec(config, manager, resource, *ttl, command).await,
        Command::Hold { resource, ttl } => hold(config, manager, resource, *ttl, shutdown).await,
    }
}

fn exit_code(ok: bool) -> i32 {
    if ok {
        0
    } else {
        1
    }
}

async fn acquire(
    config: &Config,
    manager: &LockManager,
    resource: &str,
    ttl: Option<u64>,
) -> anyhow::Result<LockToken> {
    let settings = manager.config();
    match manager
        .acquire(
            resource,
            config.ttl(ttl),
            settings.retry_attempts,
            settings.retry_delay,
        )
        .await
    {
        Some(token) => Ok(token),
        None => bail!("Lock on {} is held elsewhere or the store is unreachable", resource),
    }
}

async fn exec(
    config: &Config,
    manager: &LockManager,
    resource: &str,
    ttl: Option<u64>,
    command: &[String],
) -> anyhow::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("No command given"))?;
    let ttl = config.ttl(ttl);

    let status = manager
        .with_lock(resource, ttl, manager.config().retry_attempts, || async {
            info!("Running {} under lock on {}", program, resource);
            ProcessCommand::new(program)
                .args(args)
                .status()
                .await
                .with_context(|| format!("Failed to run {}", program))
        })
        .await?;

    if !status.success() {
        warn!("{} exited with {}", program, status);
    }
    Ok(status.code().unwrap_or(1))
}

/// Interval between renewals: a third of the ttl, so two renewals can fail
/// before the lock lapses.
fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(100))
}

async fn hold(
    config: &Config,
    manager: &LockManager,
    resource: &str,
    ttl: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<i32> {
    let token = acquire(config, manager, resource, ttl).await?;
    let ttl = config.ttl(ttl);
    let every = renew_interval(ttl);
    println!("{}", token);
    info!("Holding lock on {} (renewing every {:?})", resource, every);

    let breaker = CircuitBreaker::new(
        format!("renew:{}", resource),
        CircuitBreakerConfig {
            failure_threshold: RENEW_FAILURE_THRESHOLD,
            reset_timeout: ttl,
            half_open_max_attempts: 1,
        },
    );

    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately; the lock was just acquired.
    ticker.tick().await;

    let code = loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|&stop| stop).await; } => {
                info!("Shutdown requested, releasing lock on {}", resource);
                break 0;
            }
            _ = ticker.tick() => {
                let renewed = breaker
                    .call(|| manager.try_extend(resource, &token, ttl))
                    .await;

                match renewed {
                    Ok(true) => debug!("Renewed lock on {}", resource),
                    Ok(false) => {
                        warn!("Lock on {} expired or was taken by another owner", resource);
                        break 1;
                    }
                    Err(CircuitBreakerError::Operation(e)) => {
                        warn!("Failed to renew lock on {}: {}", resource, e);
                    }
                    Err(e @ CircuitBreakerError::Open { .. }) => {
                        warn!("{}; lock on {} considered lost", e, resource);
                        break 1;
                    }
                }
            }
        }
    };

    if !manager.release(resource, &token).await {
        warn!("Lock on {} was no longer ours to release", resource);
    }
    Ok(code)
}
