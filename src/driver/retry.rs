//! Retry with jittered backoff for transient failures.

use crate::config::ChConfig;
use crate::error::ChResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// How many times, and how far apart, a failed operation is re-run.
///
/// Only errors for which [`ChError::is_retryable`](crate::ChError::is_retryable)
/// holds are retried: transport failures and a fixed set of server codes
/// meaning timeout or overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ChConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ChConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            min_backoff: config.min_retry_backoff,
            max_backoff: config.max_retry_backoff,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Uniformly jittered pause in `[min_backoff, max_backoff]`.
    pub fn backoff(&self) -> Duration {
        if self.min_backoff >= self.max_backoff {
            return self.min_backoff;
        }
        rand::rng().random_range(self.min_backoff..=self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `op` receives the zero-based attempt number.
    ///
    /// A backoff that would end past `deadline` is not slept; the last error
    /// is returned instead.
    pub async fn run<T, F, Fut>(&self, deadline: Option<Instant>, mut op: F) -> ChResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ChResult<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;
            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }

            let backoff = self.backoff();
            if deadline.is_some_and(|d| Instant::now() + backoff >= d) {
                return Err(err);
            }
            tracing::warn!(
                attempt,
                max_retries = self.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
