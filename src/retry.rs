//! Bounded retry with exponential backoff for transient KMS failures.

use std::cmp;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

/// Retry configuration for retryable errors only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the next try, `attempt` being the 1-based attempt that failed.
    fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let mult = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let capped = cmp::min(self.base_delay_ms.saturating_mul(mult), self.max_delay_ms);
        // Bounded jitter: up to 50% of the capped delay.
        let jitter_cap = capped / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        capped.saturating_add(jitter)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. The last error is returned on exhaustion.
pub async fn with_backoff<T, F, Fut>(cfg: &RetryConfig, op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = cfg.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay_ms = cfg.backoff_delay_ms(attempt);
                warn!(op, attempt, attempts, delay_ms, error = %e, "transient failure; retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
