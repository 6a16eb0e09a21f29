//! Exponential backoff around calls to the run service.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_with::DurationSecondsWithFrac;
use serde_with::serde_as;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::error::ClassifiedError;

/// How often and how patiently a failed call is retried.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub base_delay: Duration,
    pub backoff_factor: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let policy = Self {
            max_retries,
            base_delay,
            backoff_factor,
            max_delay,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "retry base_delay must be greater than zero".to_string(),
            ));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "retry backoff_factor must be greater than 1, got {}",
                self.backoff_factor
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "retry max_delay must not be shorter than base_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep before retry number `attempt + 1`: `base * factor^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Wait chosen for a failed attempt. Server-provided `retry_after` wins
    /// but is still bounded by `max_delay`.
    fn backoff(&self, err: &ClassifiedError, attempt: u32) -> Duration {
        err.retry_after
            .map(|wait| wait.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for(attempt))
    }
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are used up. Both the call and the sleeps
/// between attempts end early when `cancel` fires.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(operation)),
            outcome = call() => outcome,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.retryable {
            return Err(err);
        }
        if attempt >= policy.max_retries {
            tracing::warn!(
                operation,
                attempts = attempt + 1,
                kind = %err.kind,
                "retries exhausted"
            );
            return Err(err.with_attempts(attempt + 1));
        }

        let delay = policy.backoff(&err, attempt);
        tracing::debug!(
            operation,
            attempt = attempt + 1,
            kind = %err.kind,
            delay_ms = delay_millis(delay),
            "retrying after transient failure"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Saturates instead of wrapping for delays beyond `u64::MAX` milliseconds.
fn delay_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn cancelled(operation: &str) -> ClassifiedError {
    ClassifiedError::deadline_exceeded(format!("{operation} cancelled before completion"))
}
