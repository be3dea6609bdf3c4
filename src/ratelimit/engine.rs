//! Rate limit checks against the protection store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use super::algorithm::{Algorithm, AlgorithmParams, RateLimitDecision, WindowRequest};
use crate::clock::{deadline_after, millis_of, Clock};
use crate::error::{ProtectionError, Result};
use crate::failure::{FailurePolicy, Guarded};
use crate::key::{ProtectionKey, DEFAULT_SEPARATOR};

/// Longest accepted window. Buckets must also refill completely within it.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Slowest accepted refill or leak rate, in units per second.
pub const MIN_RATE: f64 = 1.0 / MAX_WINDOW_SECS as f64;

/// What to do when a check is over the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceedStrategy {
    /// Report the rejection immediately
    #[default]
    Reject,
    /// Wait up to the queue timeout, then check once more
    Queue,
}

/// Fully resolved limit for one check.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitSpec {
    pub permits: u64,
    pub window_secs: u64,
    pub algorithm: Algorithm,
    pub params: AlgorithmParams,
    pub strategy: ExceedStrategy,
    pub queue_timeout: Duration,
}

impl LimitSpec {
    /// A rejecting limit with default bucket parameters.
    pub fn new(permits: u64, window_secs: u64, algorithm: Algorithm) -> Self {
        Self {
            permits,
            window_secs,
            algorithm,
            params: AlgorithmParams::default(),
            strategy: ExceedStrategy::Reject,
            queue_timeout: Duration::ZERO,
        }
    }

    pub fn with_params(mut self, params: AlgorithmParams) -> Self {
        self.params = params;
        self
    }

    pub fn queued(mut self, timeout: Duration) -> Self {
        self.strategy = ExceedStrategy::Queue;
        self.queue_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.permits == 0 {
            return Err(ProtectionError::Configuration(
                "permits must be greater than zero".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(ProtectionError::Configuration(
                "window must be at least one second".to_string(),
            ));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(ProtectionError::Configuration(format!(
                "window must not exceed {} seconds, got {}",
                MAX_WINDOW_SECS, self.window_secs
            )));
        }
        let capacity = self.capacity();
        if !(capacity.is_finite() && capacity >= 1.0) {
            return Err(ProtectionError::Configuration(format!(
                "bucket capacity must be at least 1, got {}",
                capacity
            )));
        }
        let rate = self.rate();
        if !(rate.is_finite() && rate >= MIN_RATE) {
            return Err(ProtectionError::Configuration(format!(
                "refill rate must be at least one unit per {} seconds, got {}",
                MAX_WINDOW_SECS, rate
            )));
        }
        // One second of slack absorbs rounding in permits / window.
        if capacity / rate > MAX_WINDOW_SECS as f64 + 1.0 {
            return Err(ProtectionError::Configuration(format!(
                "bucket of {} at {} per second takes longer than {} seconds to refill",
                capacity, rate, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    /// Bucket capacity, defaulting to the permit count.
    pub fn capacity(&self) -> f64 {
        self.params.capacity.unwrap_or(self.permits as f64)
    }

    /// Refill or leak rate per second, defaulting to permits over the window.
    pub fn rate(&self) -> f64 {
        self.params
            .refill_rate
            .unwrap_or(self.permits as f64 / self.window_secs as f64)
    }
}

/// Runs rate limit algorithms through the failure policy.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug, Clone)]
pub struct AlgorithmEngine {
    failure: Arc<FailurePolicy>,
    clock: Arc<dyn Clock>,
    separator: String,
}

impl AlgorithmEngine {
    pub fn new(failure: Arc<FailurePolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure,
            clock,
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    /// Use the separator of the key builder producing this engine's keys.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    fn request(&self, spec: &LimitSpec) -> Result<WindowRequest> {
        spec.validate()?;
        Ok(WindowRequest {
            algorithm: spec.algorithm,
            permits: spec.permits,
            window_ms: spec.window_secs.saturating_mul(1000),
            capacity: spec.capacity(),
            rate: spec.rate(),
            now_ms: self.clock.now_millis(),
            member: Uuid::new_v4().to_string(),
            separator: self.separator.clone(),
        })
    }

    /// One check, consuming a permit if allowed.
    pub async fn check(&self, key: &ProtectionKey, spec: &LimitSpec) -> Result<RateLimitDecision> {
        let request = self.request(spec)?;

        trace!(
            key = %key,
            algorithm = %spec.algorithm,
            permits = spec.permits,
            window_secs = spec.window_secs,
            "Checking rate limit"
        );

        let req = &request;
        let decision = match self
            .failure
            .call(move |store| async move { store.evaluate_window(key, req).await })
            .await
        {
            Guarded::Value(decision) => decision,
            Guarded::Allow => RateLimitDecision {
                allowed: true,
                limit: request.permits,
                remaining: request.permits,
                reset_at_ms: deadline_after(request.now_ms, request.window_ms),
                retry_after_ms: 0,
            },
            Guarded::Reject => RateLimitDecision {
                allowed: false,
                limit: request.permits,
                remaining: 0,
                reset_at_ms: deadline_after(request.now_ms, request.window_ms),
                retry_after_ms: request.window_ms,
            },
        };

        if !decision.allowed {
            debug!(
                key = %key,
                algorithm = %spec.algorithm,
                retry_after_ms = decision.retry_after_ms,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Check, applying the exceed strategy.
    ///
    /// Under [`ExceedStrategy::Queue`] a rejected caller sleeps for the
    /// shorter of the retry hint and the queue timeout, then checks exactly
    /// once more.
    pub async fn acquire(&self, key: &ProtectionKey, spec: &LimitSpec) -> Result<RateLimitDecision> {
        let decision = self.check(key, spec).await?;
        if decision.allowed
            || spec.strategy != ExceedStrategy::Queue
            || spec.queue_timeout.is_zero()
        {
            return Ok(decision);
        }

        let wait = Duration::from_millis(decision.retry_after_ms).min(spec.queue_timeout);
        debug!(key = %key, wait_ms = millis_of(wait), "Queueing rate limited request");
        tokio::time::sleep(wait).await;
        self.check(key, spec).await
    }
}
