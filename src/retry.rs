//! Retry execution with exponential backoff and jitter.
//!
//! Engine calls fail transiently (rate limits, timeouts, 5xx), so the
//! orchestrator runs them through a retry policy. A caller-supplied
//! predicate classifies errors; anything it rejects propagates on the
//! first failure without further attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// RetryPolicy
// ============================================================================

/// Backoff schedule for retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, applied before jitter.
    pub max_delay: Duration,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Base delay before retry `attempt` (1-based), capped at `max_delay`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry `attempt`, jittered when enabled.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            base
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Run an async operation under this policy.
    ///
    /// `op` is invoked up to `max_retries + 1` times. Errors rejected by
    /// `is_retryable` return immediately as [`RetryError::NotRetryable`];
    /// once the attempt budget is exhausted the last error is returned
    /// inside [`RetryError::Exhausted`].
    pub async fn execute<T, E, Fut, Op, Pred>(
        &self,
        mut op: Op,
        is_retryable: Pred,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Pred: Fn(&E) -> bool,
        E: std::error::Error + 'static,
    {
        let total_attempts = self.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(RetryError::NotRetryable(e)),
                Err(e) if attempt >= total_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        total_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute) with identical
    /// semantics, sleeping on the current thread.
    pub fn execute_sync<T, E, Op, Pred>(
        &self,
        mut op: Op,
        is_retryable: Pred,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Result<T, E>,
        Pred: Fn(&E) -> bool,
        E: std::error::Error + 'static,
    {
        let total_attempts = self.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(RetryError::NotRetryable(e)),
                Err(e) if attempt >= total_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        total_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The classifier rejected the error; it propagates unchanged.
    #[error(transparent)]
    NotRetryable(E),

    /// Every attempt failed with a retryable error.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying error, whichever way the retry loop ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::NotRetryable(e) | Self::Exhausted { last: e, .. } => e,
        }
    }
}

/// HTTP status classification used by the engine adapter: rate limiting
/// and server errors are worth retrying, everything else is not.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

// ============================================================================
// Tests
// ============================================================================
