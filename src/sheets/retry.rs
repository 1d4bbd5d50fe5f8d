use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::types::{ErrorClass, SheetError};

/// Exponential backoff with jitter for rate-limited and transient failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the random offset added to or taken from each delay
    pub jitter_ms: u64,
}

pub trait BackoffPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    /// Delay before retry number `attempt` (0 for the first retry):
    /// base * 2^attempt, plus or minus jitter, capped at the maximum
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.nominal_delay_ms(attempt);
        let jittered = if self.jitter_ms == 0 {
            base
        } else {
            let jitter = self.jitter_ms.min(i64::MAX as u64) as i64;
            let offset = rand::rng().random_range(-jitter..=jitter);
            (base as i64).saturating_add(offset).max(0) as u64
        };
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}

impl RetryPolicy {
    /// Policy that never sleeps and never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached. The closure receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, SheetError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SheetError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = err.class();
            if class == ErrorClass::Permanent {
                return Err(err);
            }

            if attempt + 1 >= max_attempts {
                tracing::warn!(operation, attempts = attempt + 1, ?class, "giving up: {}", err);
                return Err(err.map_message(|m| format!("{} (gave up after {} attempts)", m, attempt + 1)));
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                ?class,
                "retrying after error: {}",
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
