use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};
use warden_core::{AtomicStore, GuardedMutation, StoreError, TtlStatus};

/// Shortest expiry a key can be given. Redis rejects `PX 0`, and a key that
/// expires on the instant it is written would let every caller "win" it.
const MIN_TTL: Duration = Duration::from_millis(1);

/// Conditional writes between two full sweeps of expired keys.
const SWEEP_EVERY: usize = 1024;

/// Deadline for a key written at `now` with `ttl`.
fn expiry(now: Instant, ttl: Duration) -> Result<Instant, StoreError> {
    now.checked_add(ttl.max(MIN_TTL))
        .ok_or_else(|| StoreError::InvalidArgument(format!("ttl {:?} is out of range", ttl)))
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store for single-node deployments and tests.
///
/// Each primitive runs under the map's per-key entry lock, which makes it atomic
/// with respect to every other caller sharing the same `MemoryStore`. Expired
/// keys are dropped lazily when touched, and by a full sweep every 1024
/// conditional writes so abandoned keys on distinct resources do
/// not accumulate. Time is read from `tokio::time`, so a paused runtime clock
/// drives expiry deterministically.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    ///
    /// While unavailable every primitive fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Unconditionally write `key`. `None`, or a ttl too large to represent,
    /// stores the key without expiry.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl.max(MIN_TTL)));
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    /// Current value of `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone());
        if value.is_none() {
            self.purge_expired(key, now);
        }
        value
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired_all(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} expired keys", removed);
        }
        removed
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }

    fn purge_expired(&self, key: &str, now: Instant) {
        if self
            .entries
            .remove_if(key, |_, stored| !stored.is_live(now))
            .is_some()
        {
            debug!("Expired key {} removed", key);
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired_all();
        }

        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: Some(expiry(now, ttl)?),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                // Expired holder: the slot is free.
                occupied.insert(stored);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_mutate(
        &self,
        key: &str,
        expected: &str,
        mutation: GuardedMutation,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let expires_at = match mutation {
            GuardedMutation::Expire(ttl) => Some(expiry(now, ttl)?),
            GuardedMutation::Delete => None,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(false),
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now);
                if !live {
                    occupied.remove();
                    return Ok(false);
                }
                if occupied.get().value != expected {
                    return Ok(false);
                }
                match expires_at {
                    None => {
                        occupied.remove();
                    }
                    Some(at) => occupied.get_mut().expires_at = Some(at),
                }
                Ok(true)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let status = match self.entries.get(key) {
            None => TtlStatus::Missing,
            Some(stored) => match stored.expires_at {
                None => TtlStatus::Persistent,
                Some(at) if at > now => TtlStatus::Expires(at - now),
                Some(_) => TtlStatus::Missing,
            },
        };
        if status == TtlStatus::Missing {
            self.purge_expired(key, now);
        }
        Ok(status)
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.ttl(key).await?.exists())
    }
}
