//! Core traits and types for warden store backends.
//!
//! This crate defines the abstraction shared between the in-memory and Redis stores:
//! - `AtomicStore`: conditional writes, guarded compare-and-mutate, ttl and existence queries
//! - `GuardedMutation`: the mutations a compare-and-mutate transaction may apply
//! - `TtlStatus`: remaining lifetime of a key
//! - `StoreError`: failures reported by a backend

mod error;
mod store;

pub use error::StoreError;
pub use store::{AtomicStore, GuardedMutation, TtlStatus};
