//! Token bucket.
//!
//! Tokens refill continuously at `rate` per second up to `capacity`; each
//! admitted request takes one. An idle bucket allows a burst of `capacity`.

use super::algorithm::{
    millis_for, Algorithm, RateAlgorithm, RateLimitDecision, WindowRequest, WindowState, EPSILON,
};
use crate::clock::deadline_after;

const SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[4])
local rate = tonumber(ARGV[5])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * rate / 1000)
if tokens > capacity - 1e-9 then
  tokens = capacity
end
local allowed = 0
local retry = 0
if tokens >= 1 - 1e-9 then
  tokens = math.max(0, tokens - 1)
  allowed = 1
else
  retry = math.ceil((1 - tokens) * 1000 / rate)
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', KEYS[1], ARGV[7])
local reset_at = now
if capacity - tokens > 1e-9 then
  reset_at = now + math.ceil((capacity - tokens) * 1000 / rate)
end
return {allowed, math.floor(tokens + 1e-9), reset_at, retry}
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl RateAlgorithm for TokenBucket {
    fn kind(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn state_ttl_ms(&self, request: &WindowRequest) -> u64 {
        millis_for(request.capacity, request.rate).max(1)
    }

    fn apply(
        &self,
        state: Option<WindowState>,
        request: &WindowRequest,
    ) -> (WindowState, RateLimitDecision) {
        let (tokens, last_refill_ms) = match state {
            Some(WindowState::Bucket {
                tokens,
                last_refill_ms,
            }) => (tokens, last_refill_ms),
            _ => (request.capacity, request.now_ms),
        };

        let elapsed = (request.now_ms - last_refill_ms).max(0) as f64;
        let mut tokens = (tokens + elapsed * request.rate / 1000.0).min(request.capacity);
        if tokens > request.capacity - EPSILON {
            tokens = request.capacity;
        }

        let allowed = tokens >= 1.0 - EPSILON;
        let retry_after_ms = if allowed {
            tokens = (tokens - 1.0).max(0.0);
            0
        } else {
            millis_for(1.0 - tokens, request.rate)
        };

        let decision = RateLimitDecision {
            allowed,
            limit: request.capacity.floor() as u64,
            remaining: (tokens + EPSILON).floor() as u64,
            reset_at_ms: deadline_after(
                request.now_ms,
                millis_for(request.capacity - tokens, request.rate),
            ),
            retry_after_ms,
        };
        (
            WindowState::Bucket {
                tokens,
                last_refill_ms: request.now_ms,
            },
            decision,
        )
    }

    fn script(&self) -> &'static str {
        SCRIPT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::algorithm::request;

    fn bucket_request(capacity: f64, rate: f64, now_ms: i64) -> WindowRequest {
        let mut req = request(Algorithm::TokenBucket, capacity as u64, 60, now_ms);
        req.capacity = capacity;
        req.rate = rate;
        req
    }

    fn drain(state: &mut Option<WindowState>, capacity: f64, rate: f64, now_ms: i64) -> u32 {
        let mut admitted = 0;
        loop {
            let (next, decision) = TokenBucket.apply(state.take(), &bucket_request(capacity, rate, now_ms));
            *state = Some(next);
            if !decision.allowed {
                return admitted;
            }
            admitted += 1;
        }
    }

    #[test]
    fn test_fresh_bucket_allows_full_burst() {
        let mut state = None;
        assert_eq!(drain(&mut state, 5.0, 1.0, 0), 5);
    }

    #[test]
    fn test_refill_after_idle_restores_capacity() {
        let mut state = None;
        assert_eq!(drain(&mut state, 5.0, 1.0, 0), 5);
        // Idle for capacity / rate = 5 seconds.
        assert_eq!(drain(&mut state, 5.0, 1.0, 5_000), 5);
    }

    #[test]
    fn test_refill_with_fractional_default_rate() {
        // 10 permits per 60 seconds.
        let rate = 10.0 / 60.0;
        let mut state = None;
        assert_eq!(drain(&mut state, 10.0, rate, 0), 10);
        assert_eq!(drain(&mut state, 10.0, rate, 60_000), 10);
    }

    #[test]
    fn test_partial_refill_and_retry_hint() {
        let mut state = None;
        assert_eq!(drain(&mut state, 2.0, 2.0, 0), 2);

        let (next, decision) = TokenBucket.apply(state.take(), &bucket_request(2.0, 2.0, 250));
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 250);

        let (_, decision) = TokenBucket.apply(Some(next), &bucket_request(2.0, 2.0, 500));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }
}
