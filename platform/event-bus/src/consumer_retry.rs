//! Consumer retry logic with exponential backoff
//!
//! Retries are an explicit bounded state machine ([`RetryState`]): an attempt
//! counter plus the earliest instant the next attempt may start. Callers drive
//! it with [`RetryState::record_failure`] and sleep until
//! [`RetryState::next_eligible_at`]; nothing recurses.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// No retries: one attempt only
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, given `attempt` failed attempts
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `next_eligible_at` has passed
    RetryAt(Instant),
    /// Attempts exhausted (or the error is not retryable)
    GiveUp,
}

/// Attempt bookkeeping for one unit of work
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    next_eligible_at: Instant,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_eligible_at: Instant::now(),
        }
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_eligible_at(&self) -> Instant {
        self.next_eligible_at
    }

    /// Mark the start of an attempt
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a failed attempt and decide whether another one is allowed
    pub fn record_failure(&mut self, config: &RetryConfig, retryable: bool) -> RetryDecision {
        if !retryable || self.attempts >= config.max_attempts {
            return RetryDecision::GiveUp;
        }
        self.next_eligible_at = Instant::now() + config.backoff_after(self.attempts);
        RetryDecision::RetryAt(self.next_eligible_at)
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry; receives the 1-based attempt number
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "trade.booked")
/// * `is_retryable` - Errors for which this returns false end the loop immediately
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() {
/// let config = RetryConfig::default();
/// let outcome = retry_with_backoff(
///     |_attempt| async { Ok::<_, String>(42) },
///     &config,
///     "example_operation",
///     |_err| true,
/// )
/// .await;
/// assert_eq!(outcome.result, Ok(42));
/// assert_eq!(outcome.attempts, 1);
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    is_retryable: R,
) -> RetryOutcome<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut state = RetryState::new();

    loop {
        let attempt = state.begin_attempt();

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return RetryOutcome {
                    result: Ok(result),
                    attempts: attempt,
                };
            }
            Err(e) => match state.record_failure(config, is_retryable(&e)) {
                RetryDecision::GiveUp => {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed, giving up"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                RetryDecision::RetryAt(at) => {
                    warn!(
                        context = %context,
                        attempt = attempt,
                        max_attempts = config.max_attempts,
                        backoff_ms = config.backoff_after(attempt).as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying with backoff"
                    );
                    sleep_until(at).await;
                }
            },
        }
    }
}
