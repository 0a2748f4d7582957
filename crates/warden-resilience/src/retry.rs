//! Retry with exponential backoff.
//!
//! Attempt `n` (1-based) that fails with a retryable error is followed by a
//! delay of `min(initial_delay * backoff_multiplier^(n-1), max_delay)` before
//! attempt `n + 1`. When `retryable_errors` is empty every error is retried;
//! otherwise only errors whose message contains one of the substrings
//! (case-insensitive) are, and any other error is returned at once.
//!
//! The error handed back is always the operation's own last error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Options for [`execute`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Substrings marking an error retryable; empty retries everything
    pub retryable_errors: Vec<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_retryable_errors<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = substrings.into_iter().map(Into::into).collect();
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis.max(0.0) as u64)
        }
    }

    /// Whether an error with this message may be retried.
    pub fn is_retryable(&self, message: &str) -> bool {
        if self.retryable_errors.is_empty() {
            return true;
        }
        let message = message.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `options.max_attempts` attempts have been made.
pub async fn execute<T, E, F, Fut>(options: &RetryOptions, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    execute_with_notify(options, operation, |_, _| {}).await
}

/// Like [`execute`], calling `on_retry(attempt, &error)` before each backoff
/// delay. `attempt` is the 1-based number of the attempt that just failed.
pub async fn execute_with_notify<T, E, F, Fut, N>(
    options: &RetryOptions,
    mut operation: F,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    N: FnMut(u32, &E),
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let message = err.to_string();
        if !options.is_retryable(&message) {
            warn!(
                "Non-retryable error on attempt {}/{}: {}",
                attempt, max_attempts, message
            );
            return Err(err);
        }

        if attempt >= max_attempts {
            warn!(
                "Operation failed after {} attempts: {}",
                max_attempts, message
            );
            return Err(err);
        }

        let delay = options.delay_for_attempt(attempt);
        debug!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            attempt, max_attempts, message, delay
        );
        on_retry(attempt, &err);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("{0}")]
    struct CallError(String);

    fn fast_options() -> RetryOptions {
        RetryOptions::default()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(1000))
    }

    #[test]
    fn test_delay_sequence_is_capped() {
        let options = fast_options();
        let delays: Vec<u64> = (1..=6)
            .map(|n| options.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_delay_with_huge_exponent_saturates() {
        let options = fast_options();
        assert_eq!(options.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_default_options() {
        let options = RetryOptions::default();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(options.delay_for_attempt(2), Duration::from_secs(2));
        assert!(options.is_retryable("anything at all"));
    }

    #[test]
    fn test_retryable_match_is_case_insensitive() {
        let options = RetryOptions::default().with_retryable_errors(["Timeout", "connection"]);
        assert!(options.is_retryable("request TIMEOUT after 5s"));
        assert!(options.is_retryable("Connection reset by peer"));
        assert!(!options.is_retryable("invalid input"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_backoff() {
        let options = fast_options();
        let start = Instant::now();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let retries = Arc::new(Mutex::new(Vec::new()));

        let result = execute_with_notify(
            &options,
            || {
                let attempts = attempts.clone();
                async move {
                    let mut attempts = attempts.lock().unwrap();
                    attempts.push(start.elapsed());
                    if attempts.len() < 4 {
                        Err(CallError(format!("timeout #{}", attempts.len())))
                    } else {
                        Ok("done")
                    }
                }
            },
            |attempt, _err: &CallError| retries.lock().unwrap().push(attempt),
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(*retries.lock().unwrap(), vec![1, 2, 3]);

        let offsets: Vec<u64> = attempts
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        let gaps: Vec<u64> = offsets.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![100, 200, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let options = fast_options().with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = execute(&options, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(CallError(format!("failure {}", n))) }
        })
        .await;

        assert_eq!(result, Err(CallError("failure 3".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let options = fast_options().with_retryable_errors(["timeout"]);
        let calls = AtomicU32::new(0);
        let mut retries = 0;

        let result: Result<(), CallError> = execute_with_notify(
            &options,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError("invalid input".to_string())) }
            },
            |_, _| retries += 1,
        )
        .await;

        assert_eq!(result, Err(CallError("invalid input".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_listed_error_is_retried() {
        let options = fast_options().with_retryable_errors(["timeout"]);
        let calls = AtomicU32::new(0);

        let result = execute(&options, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(CallError("upstream Timeout".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let options = RetryOptions::default().with_max_attempts(0);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = execute(&options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallError("nope".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_does_not_block_other_tasks() {
        let options = fast_options().with_max_attempts(2);

        let retrying = tokio::spawn(async move {
            execute(&options, || async { Err::<(), _>(CallError("timeout".into())) }).await
        });
        let other = tokio::spawn(async { 7 });

        assert_eq!(other.await.unwrap(), 7);
        assert!(retrying.await.unwrap().is_err());
    }
}
