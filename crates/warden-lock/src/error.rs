use thiserror::Error;

/// Errors raised by the lock manager.
///
/// Only [`LockManager::with_lock`](crate::LockManager::with_lock) raises; the
/// other operations report contention and store failures as plain results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Failed to acquire lock on resource: {0}")]
    NotAcquired(String),
}
