//! Retry with exponential backoff

use error_common::{sanitize_for_logging, RequestResult};
use std::future::Future;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles every attempt
    pub base_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Same policy with `delta` more (or fewer) retries
    pub fn adjusted(&self, delta: i32) -> Self {
        let max_retries = if delta >= 0 {
            self.max_retries.saturating_add(delta.unsigned_abs())
        } else {
            self.max_retries.saturating_sub(delta.unsigned_abs())
        };
        Self { max_retries, ..*self }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `op` receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RequestResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RequestResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                tracing::debug!(attempt, kind = err.kind(), "Non-retryable failure");
                return Err(err);
            }
            Err(err) if attempt >= policy.max_retries => {
                tracing::warn!(
                    attempts = attempt + 1,
                    kind = err.kind(),
                    error = %sanitize_for_logging(&err.to_string()),
                    "Retries exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    kind = err.kind(),
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
