use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlStatus {
    /// The key exists and expires after the given duration.
    Expires(Duration),
    /// The key exists but has no expiry.
    Persistent,
    /// The key does not exist.
    Missing,
}

impl TtlStatus {
    /// Integer form of the status: seconds remaining rounded to the nearest
    /// second (as Redis `TTL` reports them), `-1` when the key has no expiry,
    /// `-2` when the key is absent.
    pub fn as_seconds(&self) -> i64 {
        match self {
            TtlStatus::Expires(remaining) => {
                i64::try_from((remaining.as_millis() + 500) / 1000).unwrap_or(i64::MAX)
            }
            TtlStatus::Persistent => -1,
            TtlStatus::Missing => -2,
        }
    }

    /// Build a status from a millisecond reply in the `PTTL` convention
    /// (`-1` no expiry, `-2` missing).
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            -2 => TtlStatus::Missing,
            -1 => TtlStatus::Persistent,
            ms if ms < 0 => TtlStatus::Missing,
            ms => TtlStatus::Expires(Duration::from_millis(ms as u64)),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, TtlStatus::Missing)
    }
}

/// Mutation applied by [`AtomicStore::compare_and_mutate`] when the stored value matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedMutation {
    /// Delete the key.
    Delete,
    /// Reset the key's time-to-live.
    Expire(Duration),
}

impl GuardedMutation {
    pub fn name(&self) -> &'static str {
        match self {
            GuardedMutation::Delete => "delete",
            GuardedMutation::Expire(_) => "expire",
        }
    }
}

/// Atomic key-value store abstraction.
///
/// Every method must be indivisible from the point of view of other clients of
/// the same store: cross-process correctness of the lock manager relies only on
/// these primitives, never on in-process locking.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Returns the store type identifier (e.g., "memory", "redis").
    fn store_type(&self) -> &'static str;

    /// Set `key` to `value` with the given time-to-live, only if `key` is absent.
    ///
    /// # Returns
    /// * `Ok(true)` - The key was written
    /// * `Ok(false)` - The key already exists
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Apply `mutation` to `key` only if its current value equals `expected`,
    /// evaluated as one transaction inside the store.
    ///
    /// Returns `Ok(false)` when the key is missing or holds another value.
    async fn compare_and_mutate(
        &self,
        key: &str,
        expected: &str,
        mutation: GuardedMutation,
    ) -> Result<bool, StoreError>;

    /// Remaining time-to-live of `key`.
    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
