//! Retry Controller
//!
//! Wraps one upstream call with the configured rate-limit retry schedule.
//!
//! - Only [`GatewayError::RateLimit`] is retried. Everything else returns at
//!   once, after being recorded against the endpoint.
//! - The schedule lists the delay before each retry, so a schedule of
//!   `[1s, 5s, 60s]` allows four attempts in total.
//! - When the schedule runs out the last `RateLimit` is returned as is.
//! - Backoff sleeps and in-flight attempts both abort when the request's
//!   cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::health::HealthRegistry;
use crate::config::{EndpointId, RetryPolicy};
use crate::error::{GatewayError, GatewayResult};

/// Bounded retry around a single upstream call
#[derive(Debug, Clone)]
pub struct RetryController {
    schedule: Arc<[Duration]>,
    health: Arc<HealthRegistry>,
}

impl RetryController {
    /// Create a controller
    #[must_use]
    pub fn new(policy: &RetryPolicy, health: Arc<HealthRegistry>) -> Self {
        Self {
            schedule: policy.schedule.clone().into(),
            health,
        }
    }

    /// Maximum attempts, including the first
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.schedule.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Run `call` against `endpoint`, retrying throttled attempts
    ///
    /// `call` receives the 1-based attempt number. Every attempt builds a
    /// fresh future, so a streaming call reopens its upstream connection and
    /// nothing from a failed attempt carries over.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, or [`GatewayError::Cancelled`]
    /// if `cancel` fires first.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &EndpointId,
        cancel: &CancellationToken,
        mut call: F,
    ) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(GatewayError::Cancelled),
                r = call(attempt) => r,
            };

            let err = match result {
                Ok(value) => {
                    self.health.record_success(endpoint);
                    if attempt > 1 {
                        tracing::info!(
                            endpoint = %endpoint,
                            attempt,
                            "Upstream call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.counts_against_endpoint() {
                self.health.record_failure(endpoint);
            }

            let delay = match self.schedule.get((attempt - 1) as usize) {
                Some(delay) if err.is_retryable() => *delay,
                _ => {
                    if err.is_retryable() {
                        tracing::warn!(
                            endpoint = %endpoint,
                            attempts = attempt,
                            "Retry schedule exhausted"
                        );
                    }
                    return Err(err);
                }
            };

            tracing::warn!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Upstream throttled, backing off"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
