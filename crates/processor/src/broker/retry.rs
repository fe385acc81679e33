//! Bounded retry with exponential backoff for broker calls

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::error::BrokerError;

const MAX_BACKOFF_MS: u64 = 60_000;

/// Retry budget applied to transport operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further one
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Calculate exponential backoff delay
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(retry_count.min(10)));
        Duration::from_millis(backoff_ms.min(MAX_BACKOFF_MS))
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is exhausted. The last error is returned on failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && self.should_retry(retries) => {
                    let backoff = self.backoff(retries);
                    retries += 1;
                    warn!(
                        operation,
                        attempt = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`RetryPolicy::run`] for plain broker calls
    pub async fn run_broker<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        self.run(operation, BrokerError::is_retryable, op).await
    }
}
