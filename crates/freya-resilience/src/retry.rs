//! Retry with exponential backoff and jitter.

use crate::circuit::CircuitBreaker;
use crate::error::{CircuitError, RetryError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_max_delay_secs() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Backoff schedule for retrying a failed operation.
///
/// The delay before retry `n` (starting at 1) is
/// `min(base_delay * exponential_base^(n-1), max_delay)`, scaled by a random
/// factor in `[0.5, 1.0]` when `jitter` is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = (self.base_delay_secs * self.exponential_base.powi(exponent))
            .min(self.max_delay_secs)
            .max(0.0);
        if secs.is_nan() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Delay before retry `retry`, with jitter drawn from `rng` if enabled.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(retry);
        if self.jitter {
            delay.mul_f64(rng.gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    fn next_delay(&self, retry: u32) -> Duration {
        self.delay_with_rng(retry, &mut rand::thread_rng())
    }

    /// Runs `op` until it succeeds, fails with an error `should_retry`
    /// rejects, or `max_retries` retries are used up.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Aborted`] with the first non-retryable error.
    /// - [`RetryError::Exhausted`] with the last error once retries run out.
    pub async fn run<F, Fut, T, E, P>(&self, mut op: F, should_retry: P) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !should_retry(&err) {
                tracing::debug!(attempt, error = %err, "non-retryable error");
                return Err(RetryError::Aborted(err));
            }
            if attempt > self.max_retries {
                tracing::error!(attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.next_delay(attempt);
            tracing::warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Retries `op` through `breaker`.
///
/// Each attempt goes through the breaker, so failures count toward opening
/// it. A call rejected by an open circuit is returned at once as
/// [`RetryError::Aborted`] wrapping [`CircuitError::Open`]. Errors of `op`
/// are retried when `should_retry` accepts them and counted as breaker
/// failures when `is_failure` does.
///
/// # Errors
///
/// Same as [`RetryPolicy::run`], with the error wrapped in [`CircuitError`].
pub async fn retry_through<F, Fut, T, E, P, C>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
    should_retry: P,
    is_failure: C,
) -> Result<T, RetryError<CircuitError<E>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
    C: Fn(&E) -> bool,
{
    let is_failure = &is_failure;
    policy
        .run(
            move || {
                let attempt = op();
                breaker.call_with(move || attempt, move |e| is_failure(e))
            },
            |err: &CircuitError<E>| match err {
                CircuitError::Open { .. } => false,
                CircuitError::Inner(inner) => should_retry(inner),
            },
        )
        .await
}
