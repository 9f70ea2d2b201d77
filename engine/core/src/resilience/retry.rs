//! Retry with Exponential Backoff
//!
//! [`RetryPolicy`] wraps one logical call. Every attempt is gated by the
//! service's circuit breaker and reported back to it, so retries can never
//! bypass circuit protection. Attempts are strictly sequential.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::breaker::CircuitBreaker;
use crate::error::{BackendError, CallFailure};

/// Bounded retry parameters
///
/// After attempt `n` fails transiently the policy waits
/// `base_delay * backoff_multiplier^(n-1)`, capped at `max_delay`, with up to
/// `jitter` (a fraction) of random spread in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Upper bound for any delay
    pub max_delay_ms: u64,

    /// Random spread as a fraction of the delay (0.0 disables jitter)
    pub jitter: f64,

    /// HTTP status codes HTTP backends treat as transient
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Policy that makes a single attempt and never waits
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Builder: total attempts
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder: base delay and multiplier
    #[must_use]
    pub fn with_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        self.backoff_multiplier = multiplier;
        self
    }

    /// Builder: delay cap
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Builder: jitter fraction
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check if an HTTP status code should be treated as transient
    #[must_use]
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Delay to wait after attempt `attempt` (1-based) failed
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max = self.max_delay_ms as f64;
        let base = (self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent)).min(max);

        let delay_ms = if self.jitter > 0.0 {
            let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
            (base * (1.0 + spread)).clamp(0.0, max)
        } else {
            base
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation` under this policy and `breaker`
    ///
    /// `operation` receives the 1-based attempt number. When `call_timeout`
    /// is set each attempt is bounded by it and an overrun counts as a
    /// transient failure. A denied attempt ends the call with
    /// [`CallFailure::CircuitOpen`] and is not reported to the breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        call_timeout: Option<Duration>,
        mut operation: F,
    ) -> Result<T, CallFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if !breaker.can_attempt() {
                tracing::debug!(
                    service = %breaker.service_id(),
                    attempt,
                    "Attempt denied by open circuit"
                );
                return Err(CallFailure::CircuitOpen {
                    service_id: breaker.service_id().to_string(),
                });
            }

            let outcome = match call_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(limit)),
                },
                None => operation(attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            breaker.record_error(&error);

            if !error.is_transient() {
                tracing::debug!(
                    service = %breaker.service_id(),
                    attempt,
                    error = %error,
                    "Permanent failure, not retrying"
                );
                return Err(CallFailure::Permanent {
                    attempts: attempt,
                    last: error,
                });
            }

            if attempt >= max_attempts {
                return Err(CallFailure::Transient {
                    attempts: attempt,
                    last: error,
                });
            }

            let backoff = self.delay_for_attempt(attempt);
            tracing::debug!(
                service = %breaker.service_id(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient failure, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
