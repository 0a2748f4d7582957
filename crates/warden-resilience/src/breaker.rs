//! Circuit breaker for protecting remote calls.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected without running the operation
//! - Half-Open: calls pass through again to probe the resource
//!
//! # State Transitions
//! ```text
//! Closed → Open:      failure_count >= failure_threshold
//! Open → Half-Open:   first call made more than reset_timeout after the last failure
//! Half-Open → Closed: half_open_max_attempts successes
//! Half-Open → Open:   any failure
//! ```
//!
//! The Open → Half-Open check happens lazily when a call arrives; there is no
//! background timer. Each breaker owns its counters, so create one per
//! protected resource.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, requests probe whether the resource recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit lets a probe through
    pub reset_timeout: Duration,
    /// Successful calls in HalfOpen state before closing
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            half_open_max_attempts: 3,
        }
    }
}

/// Error type for circuit breaker operations
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open, the operation was not invoked
    Open { name: String },
    /// The underlying operation failed
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The operation's own error, if the operation ran.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::Open { .. } => None,
            CircuitBreakerError::Operation(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open { name } => write!(f, "Circuit breaker '{}' is open", name),
            CircuitBreakerError::Operation(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::Open { .. } => None,
            CircuitBreakerError::Operation(e) => Some(e),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
}

/// Circuit breaker guarding calls to one resource.
///
/// State lives behind a mutex that is only held for the bookkeeping around a
/// call, never while the operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_attempts: 0,
            }),
        }
    }

    /// Create a breaker with the default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking `operation` while
    /// the circuit is open.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            debug!("Circuit breaker '{}' rejected call", self.name);
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    /// Check whether a call may proceed, moving Open → Half-Open once the reset
    /// timeout has passed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock_state();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_time
                    .is_none_or(|at| at.elapsed() > self.config.reset_timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_attempts = 0;
                    info!("Circuit breaker '{}' half-open", self.name);
                }
                cooled_down
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock_state();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_attempts += 1;
                if inner.half_open_attempts >= self.config.half_open_max_attempts {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_attempts = 0;
                    info!("Circuit breaker '{}' closed", self.name);
                }
            }
            CircuitState::Open => {
                // A call admitted before another caller reopened the circuit.
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.lock_state();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                warn!("Circuit breaker '{}' reopened by failed probe", self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.lock_state().state
    }

    /// Get the consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.lock_state().failure_count
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.lock_state();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.half_open_attempts = 0;
        info!("Circuit breaker '{}' reset", self.name);
    }

    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
