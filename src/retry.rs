//! Exponential backoff for short in-process retries.
//!
//! Used where redelivery isn't an option, such as finalizing the ledger after
//! the external store has already accepted a write. Only errors reported as
//! retriable are retried; anything else returns immediately.

use std::future::Future;
use std::time::Duration;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 4 retries at 100ms, 200ms, 400ms, 800ms.
    pub const DEFAULT: Self = Self {
        max_retries: 4,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
    };

    /// No delay between attempts. For tests.
    pub const IMMEDIATE: Self = Self {
        max_retries: 4,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Total time spent sleeping between attempts when every attempt fails.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Outcome of [`retry_with_backoff`].
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),

    /// Every attempt failed with a retriable error.
    ExhaustedRetries {
        last_error: E,
        /// Attempts made, including the initial one.
        attempts: u32,
    },

    /// A non-retriable error stopped the loop.
    PermanentError(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::PermanentError(e) => Err(e),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of retries.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: RetryConfig,
    mut operation: F,
) -> RetryResult<T, E>
where
    E: Retriable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => {
                attempt += 1;

                if !e.is_retriable() {
                    return RetryResult::PermanentError(e);
                }
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                let delay = config.delay_for_attempt(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
