//! Resilience wrappers for remote calls.
//!
//! - [`retry`]: run an async operation again after failures, with exponential
//!   backoff and an optional allow-list of retryable error messages
//! - [`breaker`]: fail fast once a protected resource keeps failing, probing
//!   it again after a cool-down
//!
//! Both suspend only the calling task (`tokio::time::sleep`) and hand the
//! operation's own error back to the caller once they give up.

pub mod breaker;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::{execute, execute_with_notify, RetryOptions};
