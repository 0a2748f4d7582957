use std::time::Duration;

/// Default namespace prepended to every resource identifier.
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Configuration for a [`LockManager`](crate::LockManager).
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Prefix for lock keys in the store
    pub key_prefix: String,
    /// Time-to-live used when the caller does not pass one
    pub default_ttl: Duration,
    /// Additional acquisition attempts after the first one fails
    pub retry_attempts: u32,
    /// Flat delay between acquisition attempts
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl LockConfig {
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }
}
