use std::time::Duration;

use clap::{Parser, Subcommand};
use warden_lock::LockConfig;
use warden_resilience::RetryOptions;

/// Configuration for the warden command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "warden")]
#[command(about = "Distributed locks over Redis")]
pub struct Config {
    /// Redis connection URL
    #[arg(
        long,
        default_value = "redis://127.0.0.1:6379",
        env = "WARDEN_REDIS_URL",
        global = true
    )]
    pub redis_url: String,

    /// Namespace prepended to resource names
    #[arg(long, default_value = "lock:", env = "WARDEN_KEY_PREFIX", global = true)]
    pub key_prefix: String,

    /// Lock time-to-live in seconds when a command does not pass --ttl
    #[arg(long, default_value = "30", env = "WARDEN_LOCK_TTL_SECS", global = true)]
    pub lock_ttl_secs: u64,

    /// Additional acquisition attempts while the lock is held elsewhere
    #[arg(long, default_value = "3", env = "WARDEN_RETRY_ATTEMPTS", global = true)]
    pub retry_attempts: u32,

    /// Delay between acquisition attempts (milliseconds)
    #[arg(long, default_value = "100", env = "WARDEN_RETRY_DELAY_MS", global = true)]
    pub retry_delay_ms: u64,

    /// Attempts to reach Redis before giving up
    #[arg(long, default_value = "5", env = "WARDEN_CONNECT_ATTEMPTS", global = true)]
    pub connect_attempts: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Acquire a lock and print its ownership token
    Acquire {
        #[arg(long)]
        resource: String,
        /// Lock time-to-live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Release a lock held with the given token
    Release {
        #[arg(long)]
        resource: String,
        #[arg(long)]
        token: String,
    },
    /// Reset the time-to-live of a lock held with the given token
    Extend {
        #[arg(long)]
        resource: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print the state of a lock as JSON
    Status {
        #[arg(long)]
        resource: String,
    },
    /// Run a command while holding a lock
    Exec {
        #[arg(long)]
        resource: String,
        #[arg(long)]
        ttl: Option<u64>,
        /// Program and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Hold a lock, renewing it until interrupted
    Hold {
        #[arg(long)]
        resource: String,
        #[arg(long)]
        ttl: Option<u64>,
    },
}

impl Config {
    /// Lock manager configuration derived from the flags.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::default()
            .with_key_prefix(self.key_prefix.clone())
            .with_default_ttl(Duration::from_secs(self.lock_ttl_secs))
            .with_retry(
                self.retry_attempts,
                Duration::from_millis(self.retry_delay_ms),
            )
    }

    /// Retry policy for establishing the Redis connection.
    pub fn connect_options(&self) -> RetryOptions {
        RetryOptions::default()
            .with_max_attempts(self.connect_attempts)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(5))
            .with_retryable_errors(["connection refused", "timed out", "unavailable"])
    }

    /// `ttl` flag in seconds, or the configured default.
    pub fn ttl(&self, ttl_secs: Option<u64>) -> Duration {
        Duration::from_secs(ttl_secs.unwrap_or(self.lock_ttl_secs))
    }
}
