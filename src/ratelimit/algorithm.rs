//! Algorithm selection and the per-check window state.

use std::collections::VecDeque;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::key::ProtectionKey;

/// Slack for floating-point bucket arithmetic.
pub(crate) const EPSILON: f64 = 1e-9;

/// Rate limiting algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Timestamp log over a rolling window
    #[default]
    SlidingWindow,
    /// Counter per discrete window
    FixedWindow,
    /// Refilling bucket, tolerates bursts up to capacity
    TokenBucket,
    /// Draining queue, strict average rate
    LeakyBucket,
}

impl Algorithm {
    /// The strategy object implementing this algorithm.
    pub fn strategy(&self) -> &'static dyn RateAlgorithm {
        match self {
            Algorithm::SlidingWindow => &SlidingWindow,
            Algorithm::FixedWindow => &FixedWindow,
            Algorithm::TokenBucket => &TokenBucket,
            Algorithm::LeakyBucket => &LeakyBucket,
        }
    }

    pub fn all() -> [Algorithm; 4] {
        [
            Algorithm::SlidingWindow,
            Algorithm::FixedWindow,
            Algorithm::TokenBucket,
            Algorithm::LeakyBucket,
        ]
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Bucket tuning for the token and leaky bucket algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlgorithmParams {
    /// Bucket size; defaults to the permit count
    #[serde(default)]
    pub capacity: Option<f64>,
    /// Refill (or leak) rate per second; defaults to permits / window
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

/// One fully parameterized check, as handed to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRequest {
    pub algorithm: Algorithm,
    pub permits: u64,
    pub window_ms: u64,
    /// Bucket capacity
    pub capacity: f64,
    /// Refill or leak rate, units per second
    pub rate: f64,
    pub now_ms: i64,
    /// Unique member id for timestamp logs
    pub member: String,
    /// Separator of the key builder that produced the check's key
    pub separator: String,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the window (or bucket) is back to full, epoch ms
    pub reset_at_ms: i64,
    /// How long to wait before a retry can succeed; zero when allowed
    pub retry_after_ms: u64,
}

impl RateLimitDecision {
    /// Decision used when no limit applies.
    pub fn unlimited(now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at_ms: now_ms,
            retry_after_ms: 0,
        }
    }

    /// Whole seconds to wait, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }
}

/// Per-key algorithm state kept by the in-process store.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowState {
    /// Fixed window count for the window encoded in the state key
    Counter { count: u64 },
    /// Admitted request timestamps, oldest first
    Log(VecDeque<i64>),
    /// Token bucket
    Bucket { tokens: f64, last_refill_ms: i64 },
    /// Leaky bucket
    Queue { level: f64, last_leak_ms: i64 },
}

/// A rate limiting algorithm.
///
/// Each algorithm has two renditions of the same read-modify-write: `apply`
/// for stores that serialize access per key in-process, and a Lua script
/// for the distributed store. Both must produce identical decisions.
///
/// Script calling convention: `KEYS[1]` is the state key; `ARGV` is
/// `now_ms, window_ms, permits, capacity, rate, member, ttl_ms` and the
/// script returns `{allowed, remaining, reset_at_ms, retry_after_ms}`.
pub trait RateAlgorithm: Send + Sync + Debug {
    fn kind(&self) -> Algorithm;

    /// Store key holding this algorithm's state for a request.
    fn state_key(&self, key: &ProtectionKey, _request: &WindowRequest) -> String {
        key.as_str().to_string()
    }

    /// Idle time after which the state is equivalent to fresh state.
    fn state_ttl_ms(&self, request: &WindowRequest) -> u64;

    /// Apply one check to the current state.
    fn apply(
        &self,
        state: Option<WindowState>,
        request: &WindowRequest,
    ) -> (WindowState, RateLimitDecision);

    /// Lua source of the atomic server-side rendition.
    fn script(&self) -> &'static str;
}

/// Milliseconds to move `amount` units at `rate` units per second.
pub(crate) fn millis_for(amount: f64, rate: f64) -> u64 {
    if amount <= EPSILON {
        return 0;
    }
    if rate <= 0.0 {
        return u64::MAX;
    }
    (amount * 1000.0 / rate).ceil() as u64
}

#[cfg(test)]
pub(crate) fn request(algorithm: Algorithm, permits: u64, window_secs: u64, now_ms: i64) -> WindowRequest {
    WindowRequest {
        algorithm,
        permits,
        window_ms: window_secs.saturating_mul(1000),
        capacity: permits as f64,
        rate: permits as f64 / window_secs as f64,
        now_ms,
        member: uuid::Uuid::new_v4().to_string(),
        separator: crate::key::DEFAULT_SEPARATOR.to_string(),
    }
}
