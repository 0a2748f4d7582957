//! Distributed mutual-exclusion locks.
//!
//! A lock is a key `{prefix}{resource}` whose value is a random ownership token.
//! Acquisition is a single conditional set-if-absent with a ttl; release and
//! extend are compare-and-mutate transactions evaluated by the store, so only
//! the caller presenting the stored token can affect the lock. A holder that
//! crashes loses the lock once the ttl elapses.
//!
//! Store failures do not surface as errors from [`LockManager`]: they read as
//! "not acquired", "not released" or "missing", and are logged. The one
//! exception is [`LockManager::try_extend`], for renewal loops that must tell a
//! lost lock from an unreachable store.

mod config;
mod error;
mod manager;
pub mod store;
mod token;

pub use config::LockConfig;
pub use error::LockError;
pub use manager::{LockManager, LockStatus};
pub use token::LockToken;
pub use warden_core::{AtomicStore, GuardedMutation, StoreError, TtlStatus};
