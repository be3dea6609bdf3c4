//! Sliding window log.
//!
//! Keeps the timestamp of every admitted request inside the window. Exact,
//! at a cost proportional to the number of requests in the window.

use std::collections::VecDeque;

use super::algorithm::{Algorithm, RateAlgorithm, RateLimitDecision, WindowRequest, WindowState};

const SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < permits then
  redis.call('ZADD', KEYS[1], now, ARGV[6])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], ARGV[7])
local reset_at = now + window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  reset_at = tonumber(oldest[2]) + window
end
if allowed == 1 then
  return {1, permits - count, reset_at, 0}
end
return {0, 0, reset_at, math.max(reset_at - now, 0)}
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

impl RateAlgorithm for SlidingWindow {
    fn kind(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn state_ttl_ms(&self, request: &WindowRequest) -> u64 {
        request.window_ms
    }

    fn apply(
        &self,
        state: Option<WindowState>,
        request: &WindowRequest,
    ) -> (WindowState, RateLimitDecision) {
        let mut log = match state {
            Some(WindowState::Log(log)) => log,
            _ => VecDeque::new(),
        };

        let window_ms = i64::try_from(request.window_ms).unwrap_or(i64::MAX);
        let cutoff = request.now_ms.saturating_sub(window_ms);
        while log.front().is_some_and(|&ts| ts <= cutoff) {
            log.pop_front();
        }

        let allowed = (log.len() as u64) < request.permits;
        if allowed {
            log.push_back(request.now_ms);
        }

        let reset_at_ms = log
            .front()
            .map(|oldest| oldest.saturating_add(window_ms))
            .unwrap_or(request.now_ms.saturating_add(window_ms));

        let decision = RateLimitDecision {
            allowed,
            limit: request.permits,
            remaining: if allowed {
                request.permits - log.len() as u64
            } else {
                0
            },
            reset_at_ms,
            retry_after_ms: if allowed {
                0
            } else {
                (reset_at_ms - request.now_ms).max(0) as u64
            },
        };
        (WindowState::Log(log), decision)
    }

    fn script(&self) -> &'static str {
        SCRIPT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::algorithm::request;

    fn check(state: &mut Option<WindowState>, permits: u64, now_ms: i64) -> RateLimitDecision {
        let req = request(Algorithm::SlidingWindow, permits, 10, now_ms);
        let (next, decision) = SlidingWindow.apply(state.take(), &req);
        *state = Some(next);
        decision
    }

    #[test]
    fn test_admits_exactly_permits() {
        let mut state = None;
        for i in 0..3 {
            let decision = check(&mut state, 3, 1_000 + i);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 2 - i as u64);
        }
        let decision = check(&mut state, 3, 1_005);
        assert!(!decision.allowed);
        // Oldest admitted at 1_000, window 10s
        assert_eq!(decision.retry_after_ms, 11_000 - 1_005);
    }

    #[test]
    fn test_no_boundary_burst() {
        let mut state = None;
        // Spend the quota late in the window...
        assert!(check(&mut state, 2, 9_000).allowed);
        assert!(check(&mut state, 2, 9_500).allowed);
        // ...and the rolling window still holds them shortly after.
        assert!(!check(&mut state, 2, 10_500).allowed);
        // Once the first timestamp ages out one slot frees up.
        assert!(check(&mut state, 2, 19_001).allowed);
        assert!(!check(&mut state, 2, 19_002).allowed);
    }

    #[test]
    fn test_rejections_are_not_logged() {
        let mut state = None;
        assert!(check(&mut state, 1, 0).allowed);
        for t in 1..5 {
            assert!(!check(&mut state, 1, t).allowed);
        }
        match state {
            Some(WindowState::Log(log)) => assert_eq!(log.len(), 1),
            other => panic!("unexpected state {:?}", other),
        }
    }
}
