use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use warden_core::{AtomicStore, GuardedMutation, StoreError, TtlStatus};

use crate::config::LockConfig;
use crate::error::LockError;
use crate::token::LockToken;

/// Snapshot of a lock as seen by [`LockManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub resource: String,
    pub locked: bool,
    pub ttl: TtlStatus,
    /// `ttl` in integer form (`-1` no expiry, `-2` missing)
    pub ttl_seconds: i64,
}

/// Distributed lock manager over an [`AtomicStore`].
///
/// Lock keys: `{key_prefix}{resource}`
///
/// The manager keeps no local state about held locks; every decision is made by
/// the store, so any number of managers in any number of processes can share
/// one store.
pub struct LockManager {
    store: Arc<dyn AtomicStore>,
    config: LockConfig,
}

impl LockManager {
    /// Create a manager with the default configuration.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn AtomicStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Get the store key for a resource.
    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}{}", self.config.key_prefix, resource)
    }

    /// Attempt to acquire the lock on `resource`.
    ///
    /// Makes one conditional set, then up to `retry_attempts` more with a flat
    /// `retry_delay` between them while the lock is held elsewhere.
    ///
    /// # Returns
    /// * `Some(token)` - The lock is held; present `token` to release or extend it
    /// * `None` - Attempts exhausted, or the store could not be reached
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Option<LockToken> {
        let key = self.lock_key(resource);
        let token = LockToken::generate();
        let total = retry_attempts.saturating_add(1);

        for attempt in 1..=total {
            match self.store.set_if_absent(&key, token.as_str(), ttl).await {
                Ok(true) => {
                    info!(
                        "Acquired lock on {} (ttl {:?}, attempt {}/{})",
                        resource, ttl, attempt, total
                    );
                    return Some(token);
                }
                Ok(false) => {
                    debug!(
                        "Lock on {} held by another owner (attempt {}/{})",
                        resource, attempt, total
                    );
                }
                Err(e) => {
                    warn!("Lock store error while acquiring {}: {}", resource, e);
                    return None;
                }
            }

            if attempt < total {
                tokio::time::sleep(retry_delay).await;
            }
        }

        warn!(
            "Failed to acquire lock on {} after {} attempts",
            resource, total
        );
        None
    }

    /// Single acquisition attempt, no retries.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Option<LockToken> {
        self.acquire(resource, ttl, 0, Duration::ZERO).await
    }

    /// Acquire using the configured ttl, retry attempts and retry delay.
    pub async fn acquire_default(&self, resource: &str) -> Option<LockToken> {
        self.acquire(
            resource,
            self.config.default_ttl,
            self.config.retry_attempts,
            self.config.retry_delay,
        )
        .await
    }

    /// Release a lock.
    ///
    /// The lock is only deleted if `token` is the value currently stored.
    /// Returns `false` if the lock is missing, held by someone else, or the
    /// store failed.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn release(&self, resource: &str, token: &LockToken) -> bool {
        self.guarded(resource, token, GuardedMutation::Delete).await
    }

    /// Reset the ttl of a held lock to `ttl`, under the same ownership rule as
    /// [`release`](Self::release).
    #[instrument(skip(self, token), level = "debug")]
    pub async fn extend(&self, resource: &str, token: &LockToken, ttl: Duration) -> bool {
        self.guarded(resource, token, GuardedMutation::Expire(ttl))
            .await
    }

    /// Like [`extend`](Self::extend), but a store failure is returned instead
    /// of being folded into `false`.
    ///
    /// # Returns
    /// * `Ok(true)` - The ttl was reset
    /// * `Ok(false)` - The lock expired or is held with another token
    #[instrument(skip(self, token), level = "debug")]
    pub async fn try_extend(
        &self,
        resource: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.try_guarded(resource, token, GuardedMutation::Expire(ttl))
            .await
    }

    async fn try_guarded(
        &self,
        resource: &str,
        token: &LockToken,
        mutation: GuardedMutation,
    ) -> Result<bool, StoreError> {
        let key = self.lock_key(resource);
        let applied = self
            .store
            .compare_and_mutate(&key, token.as_str(), mutation)
            .await?;
        if applied {
            debug!("Lock {} on {} by owner", mutation.name(), resource);
        } else {
            debug!(
                "Lock {} on {} refused: not owner or not found",
                mutation.name(),
                resource
            );
        }
        Ok(applied)
    }

    async fn guarded(&self, resource: &str, token: &LockToken, mutation: GuardedMutation) -> bool {
        match self.try_guarded(resource, token, mutation).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(
                    "Lock store error during {} of {}: {}",
                    mutation.name(),
                    resource,
                    e
                );
                false
            }
        }
    }

    /// Whether any owner currently holds the lock on `resource`.
    #[instrument(skip(self), level = "debug")]
    pub async fn is_locked(&self, resource: &str) -> bool {
        match self.store.exists(&self.lock_key(resource)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Lock store error checking {}: {}", resource, e);
                false
            }
        }
    }

    /// Remaining ttl of the lock on `resource`; [`TtlStatus::Missing`] when the
    /// lock is absent or the store failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn remaining_ttl(&self, resource: &str) -> TtlStatus {
        match self.store.ttl(&self.lock_key(resource)).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Lock store error reading ttl of {}: {}", resource, e);
                TtlStatus::Missing
            }
        }
    }

    /// Inspect the lock on `resource`.
    pub async fn status(&self, resource: &str) -> LockStatus {
        let ttl = self.remaining_ttl(resource).await;
        LockStatus {
            resource: resource.to_string(),
            locked: ttl.exists(),
            ttl,
            ttl_seconds: ttl.as_seconds(),
        }
    }

    /// Run `operation` while holding the lock on `resource`.
    ///
    /// Fails with [`LockError::NotAcquired`] if the lock cannot be taken within
    /// `retry_attempts` extra attempts (spaced by the configured retry delay).
    /// Once acquired, the lock is released after `operation` completes whether
    /// it succeeded or not. A failed release is logged only: the ttl already
    /// bounds how long the lock can outlive us.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        retry_attempts: u32,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let token = self
            .acquire(resource, ttl, retry_attempts, self.config.retry_delay)
            .await
            .ok_or_else(|| LockError::NotAcquired(resource.to_string()))?;

        let result = operation().await;

        if !self.release(resource, &token).await {
            error!(
                "Failed to release lock on {} after scoped operation (expires within {:?})",
                resource, ttl
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (LockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = LockManager::new(store.clone());
        (manager, store)
    }

    #[derive(Debug, PartialEq)]
    enum JobError {
        Lock(LockError),
        Failed(&'static str),
    }

    impl From<LockError> for JobError {
        fn from(err: LockError) -> Self {
            JobError::Lock(err)
        }
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (manager, store) = setup();
        let ttl = Duration::from_secs(60);

        let token = manager.try_acquire("report-1", ttl).await.unwrap();
        assert_eq!(store.get("lock:report-1").as_deref(), Some(token.as_str()));

        // Second owner is refused
        assert!(manager.try_acquire("report-1", ttl).await.is_none());

        assert!(manager.release("report-1", &token).await);
        assert!(!manager.is_locked("report-1").await);

        // Now anyone can acquire
        assert!(manager.try_acquire("report-1", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (manager, store) = setup();
        let token = manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();

        let intruder = LockToken::generate();
        assert!(!manager.release("report-1", &intruder).await);
        assert_eq!(store.get("lock:report-1").as_deref(), Some(token.as_str()));

        // Releasing twice: the second attempt finds nothing
        assert!(manager.release("report-1", &token).await);
        assert!(!manager.release("report-1", &token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend() {
        let (manager, _store) = setup();
        let token = manager
            .try_acquire("report-1", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(manager.remaining_ttl("report-1").await.as_seconds(), 2);

        assert!(manager.extend("report-1", &token, Duration::from_secs(30)).await);
        assert_eq!(manager.remaining_ttl("report-1").await.as_seconds(), 30);

        let intruder = LockToken::generate();
        assert!(!manager.extend("report-1", &intruder, Duration::from_secs(90)).await);
        assert_eq!(manager.remaining_ttl("report-1").await.as_seconds(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_without_release() {
        let (manager, _store) = setup();
        let token = manager
            .try_acquire("report-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(manager.is_locked("report-1").await);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!manager.is_locked("report-1").await);

        // The stale owner can no longer touch the lock once another owner holds it
        let successor = manager
            .try_acquire("report-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!manager.release("report-1", &token).await);
        assert!(!manager.extend("report-1", &token, Duration::from_secs(5)).await);
        assert!(manager.release("report-1", &successor).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_with_flat_delay() {
        let (manager, _store) = setup();
        manager
            .try_acquire("report-1", Duration::from_millis(250))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let token = manager
            .acquire(
                "report-1",
                Duration::from_secs(5),
                5,
                Duration::from_millis(100),
            )
            .await;
        assert!(token.is_some());
        // Attempts at 0, 100, 200 fail; 300 succeeds after the 250ms ttl.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_retries() {
        let (manager, _store) = setup();
        manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let token = manager
            .acquire("report-1", Duration::from_secs(5), 3, Duration::from_millis(100))
            .await;
        assert!(token.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_remaining_ttl_sentinels() {
        let (manager, store) = setup();
        store.set("lock:pinned", "someone", None);

        assert_eq!(manager.remaining_ttl("pinned").await.as_seconds(), -1);
        assert_eq!(manager.remaining_ttl("absent").await.as_seconds(), -2);

        let status = manager.status("absent").await;
        assert!(!status.locked);
        assert_eq!(status.ttl_seconds, -2);
    }

    #[tokio::test]
    async fn test_store_unavailable_degrades() {
        let (manager, store) = setup();
        let token = manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();

        store.set_available(false);
        assert!(manager.try_acquire("report-2", Duration::from_secs(60)).await.is_none());
        assert!(!manager.release("report-1", &token).await);
        assert!(!manager.extend("report-1", &token, Duration::from_secs(60)).await);
        assert!(!manager.is_locked("report-1").await);
        assert_eq!(manager.remaining_ttl("report-1").await, TtlStatus::Missing);

        // The lock itself was untouched by the outage
        store.set_available(true);
        assert!(manager.release("report-1", &token).await);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_degrades() {
        let (manager, store) = setup();
        let huge = Duration::from_secs(u64::MAX);

        assert!(manager.try_acquire("report-1", huge).await.is_none());
        assert!(!manager.is_locked("report-1").await);

        let token = manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!manager.extend("report-1", &token, huge).await);
        assert_eq!(store.get("lock:report-1").as_deref(), Some(token.as_str()));
        assert!(manager.remaining_ttl("report-1").await.as_seconds() <= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_single_owner() {
        let (manager, _store) = setup();

        let first = manager.try_acquire("report-1", Duration::ZERO).await;
        let second = manager.try_acquire("report-1", Duration::ZERO).await;
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(manager.is_locked("report-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_serializes() {
        let (manager, _store) = setup();
        manager
            .try_acquire("report-1", Duration::from_millis(9_600))
            .await
            .unwrap();

        let status = manager.status("report-1").await;
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["resource"], "report-1");
        assert_eq!(json["locked"], true);
        assert_eq!(json["ttl_seconds"], 10);

        let missing = serde_json::to_value(manager.status("absent").await).unwrap();
        assert_eq!(missing["locked"], false);
        assert_eq!(missing["ttl"], "missing");
        assert_eq!(missing["ttl_seconds"], -2);
    }

    #[tokio::test]
    async fn test_try_extend_separates_refusal_from_outage() {
        let (manager, store) = setup();
        let token = manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();
        let ttl = Duration::from_secs(60);

        assert_eq!(manager.try_extend("report-1", &token, ttl).await, Ok(true));
        let intruder = LockToken::generate();
        assert_eq!(manager.try_extend("report-1", &intruder, ttl).await, Ok(false));

        store.set_available(false);
        let err = manager.try_extend("report-1", &token, ttl).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_custom_key_prefix() {
        let store = Arc::new(MemoryStore::new());
        let manager = LockManager::with_config(
            store.clone(),
            LockConfig::default().with_key_prefix("jobs:lock:"),
        );

        manager
            .try_acquire("nightly", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(manager.lock_key("nightly"), "jobs:lock:nightly");
        assert!(store.get("jobs:lock:nightly").is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_success() {
        let (manager, _store) = setup();

        let value: Result<u32, JobError> = manager
            .with_lock("report-1", Duration::from_secs(60), 0, || async { Ok(42) })
            .await;
        assert_eq!(value, Ok(42));
        assert!(!manager.is_locked("report-1").await);
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_failure() {
        let (manager, _store) = setup();

        let value: Result<u32, JobError> = manager
            .with_lock("report-1", Duration::from_secs(60), 0, || async {
                Err(JobError::Failed("boom"))
            })
            .await;
        assert_eq!(value, Err(JobError::Failed("boom")));
        assert!(!manager.is_locked("report-1").await);
    }

    #[tokio::test]
    async fn test_with_lock_not_acquired() {
        let (manager, _store) = setup();
        manager
            .try_acquire("report-1", Duration::from_secs(60))
            .await
            .unwrap();

        let mut ran = false;
        let value: Result<(), JobError> = manager
            .with_lock("report-1", Duration::from_secs(60), 0, || {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert_eq!(
            value,
            Err(JobError::Lock(LockError::NotAcquired("report-1".to_string())))
        );
        assert!(!ran);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(LockManager::new(store));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.try_acquire("contended", Duration::from_secs(60)).await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let winners = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }
}
