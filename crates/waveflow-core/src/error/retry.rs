//! Retry with exponential backoff and jitter.
//!
//! The policy is configurable per task or per step; the orchestrator
//! merges overrides and hands the result to [`retry_with_policy`], which
//! drives the attempts and reports the final attempt count.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{EngineError, Result};

/// Backoff policy for transient failures.
///
/// The delay before retry `k` (1-based) is
/// `min(initial_delay * multiplier^(k-1), max_delay) * (1 + rand(-jitter, +jitter))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 means no retry.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based, so `retry = 1` follows the
    /// first failed attempt).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Result of driving an operation through a [`RetryPolicy`], with the
/// attempt count the executor reports in step diagnostics.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails fatally, or the policy is
/// exhausted. Only errors where [`EngineError::is_retriable`] holds are
/// retried. Backoff sleeps observe `cancel` and abort promptly.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(EngineError::Cancelled),
                attempts: attempt,
            };
        }
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(error) if error.is_retriable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return RetryOutcome {
                            result: Err(EngineError::Cancelled),
                            attempts: attempt,
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                }
            }
        }
    }
}
