//! Leaky bucket.
//!
//! Each admitted request raises the level by one; the level drains at `rate`
//! per second. Requests are admitted only while the level is below capacity.

use super::algorithm::{
    millis_for, Algorithm, RateAlgorithm, RateLimitDecision, WindowRequest, WindowState, EPSILON,
};
use crate::clock::deadline_after;

const SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[4])
local rate = tonumber(ARGV[5])
local state = redis.call('HMGET', KEYS[1], 'level', 'ts')
local level = tonumber(state[1])
local ts = tonumber(state[2])
if level == nil or ts == nil then
  level = 0
  ts = now
end
local elapsed = math.max(0, now - ts)
level = math.max(0, level - elapsed * rate / 1000)
local allowed = 0
local retry = 0
if level < capacity - 1e-9 then
  level = level + 1
  allowed = 1
else
  retry = math.floor((level - capacity) * 1000 / rate) + 1
end
redis.call('HSET', KEYS[1], 'level', tostring(level), 'ts', tostring(now))
redis.call('PEXPIRE', KEYS[1], ARGV[7])
local reset_at = now
if level > 1e-9 then
  reset_at = now + math.ceil(level * 1000 / rate)
end
return {allowed, math.max(0, math.floor(capacity - level + 1e-9)), reset_at, retry}
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket;

impl RateAlgorithm for LeakyBucket {
    fn kind(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn state_ttl_ms(&self, request: &WindowRequest) -> u64 {
        // An admitted request can push the level to just under capacity + 1.
        millis_for(request.capacity + 1.0, request.rate).max(1)
    }

    fn apply(
        &self,
        state: Option<WindowState>,
        request: &WindowRequest,
    ) -> (WindowState, RateLimitDecision) {
        let (level, last_leak_ms) = match state {
            Some(WindowState::Queue {
                level,
                last_leak_ms,
            }) => (level, last_leak_ms),
            _ => (0.0, request.now_ms),
        };

        let elapsed = (request.now_ms - last_leak_ms).max(0) as f64;
        let mut level = (level - elapsed * request.rate / 1000.0).max(0.0);

        let allowed = level < request.capacity - EPSILON;
        let retry_after_ms = if allowed {
            level += 1.0;
            0
        } else if request.rate > 0.0 {
            ((level - request.capacity) * 1000.0 / request.rate).floor() as u64 + 1
        } else {
            u64::MAX
        };

        let decision = RateLimitDecision {
            allowed,
            limit: request.capacity.floor() as u64,
            remaining: (request.capacity - level + EPSILON).floor().max(0.0) as u64,
            reset_at_ms: deadline_after(request.now_ms, millis_for(level, request.rate)),
            retry_after_ms,
        };
        (
            WindowState::Queue {
                level,
                last_leak_ms: request.now_ms,
            },
            decision,
        )
    }

    fn script(&self) -> &'static str {
        SCRIPT
    }
}
