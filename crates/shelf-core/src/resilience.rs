//! Resilience Wrapper.
//!
//! One [`RetryPolicy`] is applied at every boundary where the engine calls an
//! external system:
//! - each attempt is bounded by `attempt_timeout` (an elapsed attempt counts
//!   as [`StoreError::Timeout`])
//! - only errors accepted by the `retryable` predicate are retried
//! - delays grow along the [`Backoff`] curve, scattered by `jitter`
//!
//! The total budget (`max_attempts` times timeout plus delays) is also the
//! upper bound on how long any single external call can take.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ExternalSystem, StoreError, SyncError, SyncResult};

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(retry.saturating_sub(1) as i32);
                let secs = (initial.as_secs_f64() * factor).min(max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Fraction of each delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
    pub attempt_timeout: Option<Duration>,
    pub retryable: fn(&StoreError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(config.initial_delay_ms),
                multiplier: config.multiplier,
                max: Duration::from_millis(config.max_delay_ms),
            },
            jitter: config.jitter,
            attempt_timeout: (config.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(config.attempt_timeout_ms)),
            retryable: StoreError::is_retryable,
        }
    }

    /// Retries without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: 0.0,
            attempt_timeout: None,
            retryable: StoreError::is_retryable,
        }
    }

    pub fn with_retryable(mut self, retryable: fn(&StoreError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Jittered delay before retry number `retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Run `op` under this policy.
    ///
    /// Fails with [`SyncError::ExternalSystemRejected`] on the first
    /// non-retryable error and [`SyncError::ExternalSystemUnavailable`] once
    /// every attempt failed.
    pub async fn call<T, F, Fut>(&self, system: ExternalSystem, operation: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(format!(
                        "no response within {}ms",
                        limit.as_millis()
                    ))),
                },
                None => op().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(system = %system, operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !(self.retryable)(&error) {
                return Err(SyncError::ExternalSystemRejected {
                    system,
                    operation: operation.to_string(),
                    error,
                });
            }
            if attempt >= attempts {
                return Err(SyncError::ExternalSystemUnavailable {
                    system,
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                system = %system,
                operation,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying external call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
