//! Exponential backoff for throttled remote calls
//!
//! Only `RateLimited` is retried; every other failure is returned on the
//! attempt that produced it.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{RoundingError, RoundingResult};

/// Retry policy injected into the remote store adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
}

// Serialize Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait before `attempt` (1-based). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `operation`, retrying while it reports `RateLimited` and attempts remain.
    ///
    /// # Errors
    ///
    /// The last error once attempts are exhausted, or the first non-rate-limit error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> RoundingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RoundingResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Err(RoundingError::RateLimited { retry_after }) if attempt < max_attempts => {
                    attempt += 1;
                    let delay = self.delay_before(attempt).max(retry_after.unwrap_or_default());
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Remote store throttled the request, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_rate_limited() {
                        tracing::error!(operation, attempts = attempt, "Giving up after repeated throttling");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}
