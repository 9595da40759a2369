//! Retry policy for wire-level device requests.
//!
//! The policy is a value injected into [`super::DeviceClient`]; every auth
//! attempt goes through the same [`RetryPolicy::run`] loop.

use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded exponential backoff with a retryable-error predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub retry_on: fn(&TransportError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            retry_on: TransportError::is_network,
        }
    }
}

impl RetryPolicy {
    /// Single-shot: the first failure is final. Used for scan probes.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            retry_on: |_| false,
        }
    }

    /// Default predicate with no waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error or
    /// the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if retry >= self.max_retries || !(self.retry_on)(&err) {
                        return Err(err);
                    }
                    retry += 1;
                    let delay = self.backoff(retry);
                    tracing::debug!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        retry,
                        self.max_retries + 1,
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
