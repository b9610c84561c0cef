//! Retry/backoff layer
//!
//! An explicit policy object composable around any fallible async
//! operation. The operation's error type classifies itself through
//! [`Retryable`], keeping retry logic out of business code:
//!
//! - transient failures back off exponentially with jitter
//! - rate-limit failures honor the server-provided retry-after hint
//! - permanent failures bypass retry entirely
//! - exhaustion surfaces the last transient error, tagged as exhausted

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RetrySettings;

/// Retry classification for one error instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Expected to resolve on retry (timeout, 5xx, connection reset)
    Transient,
    /// Retry cannot help (auth failure, malformed request, other 4xx)
    Permanent,
    /// Server asked us to slow down; the hint wins over computed backoff
    RateLimited(Duration),
}

/// Implemented by error types that can be wrapped by [`RetryPolicy::run`].
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;

    /// Tag the error as retries-exhausted before surfacing it. The default
    /// returns the error unchanged.
    #[must_use]
    fn into_exhausted(self) -> Self
    where
        Self: Sized,
    {
        self
    }
}

/// Exponential backoff policy with jitter, bounded by a maximum attempt
/// count. Waits are blocking sleeps scoped to the retried operation only.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Policy with no waiting, for tests and call sites that only want the
    /// attempt bound.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts are
    /// exhausted.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(op = op_name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => match err.retry_class() {
                    RetryClass::Permanent => {
                        warn!(op = op_name, attempt, error = %err, "permanent failure, not retrying");
                        return Err(err);
                    }
                    class @ (RetryClass::Transient | RetryClass::RateLimited(_)) => {
                        if attempt >= self.max_attempts {
                            warn!(
                                op = op_name,
                                attempt,
                                max_attempts = self.max_attempts,
                                error = %err,
                                "retries exhausted"
                            );
                            return Err(err.into_exhausted());
                        }
                        let delay = match class {
                            RetryClass::RateLimited(hint) => hint,
                            _ => self.backoff_delay(attempt),
                        };
                        warn!(
                            op = op_name,
                            attempt,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    /// Exponential delay for the given (1-based) attempt, capped at
    /// `max_delay`, with up to 50% additive jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_cap = exp.as_millis() as u64 / 2;
        if jitter_cap == 0 {
            return exp;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        exp + Duration::from_millis(jitter)
    }
}
