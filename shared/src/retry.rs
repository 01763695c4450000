//! Caller-side retry with exponential backoff and jitter.
//!
//! The request cache never retries on its own; callers wrap `fetch` (or a
//! remote mutation) in [`retry_with_backoff`] when they want that policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::{
    AppResult, ConfigError, BASE_RETRY_DELAY_MS, JITTER_MAX_MS, MAX_RETRY_ATTEMPTS,
    MAX_RETRY_DELAY_MS,
};

/// Backoff in milliseconds under the default policy, plus a caller-chosen jitter.
#[must_use]
pub fn calculate_retry_delay(attempt: u32, jitter_ms: u64) -> u64 {
    RetryPolicy::default()
        .backoff_ms(attempt)
        .saturating_add(jitter_ms)
}

#[must_use]
pub fn generate_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max_ms)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay_ms: BASE_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_attempts",
            });
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "base_delay_ms",
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvertedBounds {
                lower: "base_delay_ms",
                lower_value: self.base_delay_ms,
                upper: "max_delay_ms",
                upper_value: self.max_delay_ms,
            });
        }
        Ok(())
    }

    /// `base * 2^attempt`, capped at `max_delay_ms`. No jitter.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms)
    }

    /// Delay before retry number `attempt` (0-based), jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = generate_jitter(self.jitter_max_ms);
        Duration::from_millis(self.backoff_ms(attempt).saturating_add(jitter))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. The last error is returned.
#[instrument(skip(policy, op), fields(max_attempts = policy.max_attempts))]
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() {
                    debug!(code = e.code(), "Not retrying non-retryable error");
                    return Err(e);
                }
                if attempt >= max_attempts {
                    warn!(code = e.code(), attempt, "Retries exhausted");
                    return Err(e);
                }

                let delay = match e.retry_after_ms {
                    Some(ms) => Duration::from_millis(ms),
                    None => policy.delay_for(attempt - 1),
                };
                warn!(
                    code = e.code(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
