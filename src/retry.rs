//! Bounded retry with exponential backoff and full jitter.
//!
//! Applied inside the adapters to transient failures only: rate limiting is
//! handled by the gate's cool-off, auth by the adapter's single re-auth, and
//! schema errors are deterministic and never retried.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::venue::VenueError;

/// Retry policy for outbound venue calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial try.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (ms).
    pub base_delay_ms: u64,
    /// Cap for a single backoff delay (ms).
    pub max_delay_ms: u64,
    /// Cap on total elapsed time across attempts (ms).
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_500,
            max_elapsed_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Load from environment with safe defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0 && n <= 10)
                .unwrap_or(defaults.max_attempts),
            base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.base_delay_ms),
            max_delay_ms: std::env::var("RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_delay_ms),
            max_elapsed_ms: std::env::var("RETRY_MAX_ELAPSED_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_elapsed_ms),
        }
    }

    /// Backoff for a given attempt: `min(cap, base · 2^(attempt-1))` with
    /// full jitter in `[0, backoff)`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let capped = self.capped_backoff(attempt);
        if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..capped)
        }
    }

    fn capped_backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let multiplier = if exponent >= 32 {
            u64::MAX
        } else {
            1u64 << exponent
        };
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }

    #[cfg(test)]
    pub fn backoff_ms_with_jitter(&self, attempt: u32, jitter_fn: impl Fn(u64) -> u64) -> u64 {
        jitter_fn(self.capped_backoff(attempt))
    }
}

/// Retry `operation` while it fails with a transient error.
///
/// Non-transient errors (rate-limited, auth, schema, closed) return
/// immediately; the caller's policy for those kinds applies instead.
pub async fn retry_transient<T, Fut, F>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, VenueError>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        op = op_name,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "retry succeeded"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        op = op_name,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        "retry exhausted"
                    );
                    return Err(err);
                }

                let elapsed_ms = start.elapsed().as_millis() as u64;
                if elapsed_ms >= policy.max_elapsed_ms {
                    warn!(
                        op = op_name,
                        elapsed_ms,
                        max_elapsed_ms = policy.max_elapsed_ms,
                        error = %err,
                        "retry deadline exceeded"
                    );
                    return Err(err);
                }

                let backoff_ms = policy
                    .backoff_ms(attempt)
                    .min(policy.max_elapsed_ms.saturating_sub(elapsed_ms));
                debug!(
                    op = op_name,
                    attempt, backoff_ms,
                    error = %err,
                    "retrying after transient error"
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                attempt += 1;
            }
        }
    }
}
