//! Bounded exponential backoff around store writes.
//!
//! Only [`StoreError::Contention`] is retried. Any other error, and any
//! logical outcome (`Ok(false)` conflicts included), is handed back on the
//! first attempt. The delay before retry `n` (0-based) is
//! `base_delay * 2^n`; there is no sleep after the final attempt.

use std::future::Future;
use std::time::Duration;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryWriter {
    policy: RetryPolicy,
}

impl RetryWriter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Backoff after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `f` until it succeeds, fails with a non-contention error, or the
    /// attempt budget is spent (then [`StoreError::Busy`]).
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.policy.max_retries.max(1);
        for attempt in 0..attempts {
            match f().await {
                Err(StoreError::Contention(msg)) => {
                    if attempt + 1 == attempts {
                        tracing::warn!(op, attempts, error = %msg, "store write gave up");
                        break;
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(op, attempt, ?delay, error = %msg, "store contention; backing off");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
        Err(StoreError::Busy { op, attempts })
    }
}
