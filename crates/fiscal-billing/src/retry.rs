//! # Retry Policy
//!
//! Bounded exponential backoff around a single certification. Every attempt
//! sends the same payload under the same folio; only
//! [`BillingError::Network`] earns another attempt.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PacSettings;
use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &PacSettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }

    /// One attempt, no waiting.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable
    /// error, or runs out of attempts. The closure gets the 1-based attempt
    /// number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> BillingResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                if err.is_retryable() {
                    warn!(what, attempt, error = %err, "Giving up after last attempt");
                }
                return Err(err);
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(what, attempt, ?delay, error = %err, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
            debug!(what, attempt = attempt + 1, "Retrying");
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            // attempts are bounded, not time
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
