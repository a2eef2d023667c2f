//! Retry of transient store faults with exponential backoff
//!
//! Only `StoreError::Unavailable` and `StoreError::Contention` are retried.
//! A failed batch transaction has rolled back completely, so repeating it is safe.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails terminally, or runs out of attempts.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Store operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    error!(
                        operation = operation_name,
                        attempt,
                        "Store operation failed, retries exhausted: {}",
                        err
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                let delay = delay + Duration::from_millis(jitter_ms);

                warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Transient store fault, will retry: {}",
                    err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
