//! Fixed window counter.
//!
//! One integer per discrete window, stored under `key:fw:window_index`. The
//! count resets at window boundaries, so a caller can spend a full quota at
//! the end of one window and another at the start of the next. That burst is
//! inherent to the algorithm; use the sliding window where it matters.

use super::algorithm::{Algorithm, RateAlgorithm, RateLimitDecision, WindowRequest, WindowState};
use crate::key::ProtectionKey;

const SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[7])
end
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
local reset_at = (math.floor(now / window) + 1) * window
if count <= permits then
  return {1, permits - count, reset_at, 0}
end
return {0, 0, reset_at, reset_at - now}
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

impl FixedWindow {
    /// Index of the window containing `now_ms`.
    pub fn window_index(now_ms: i64, window_ms: u64) -> i64 {
        now_ms.div_euclid(i64::try_from(window_ms.max(1)).unwrap_or(i64::MAX))
    }

    /// Epoch ms at which the window containing `now_ms` ends.
    pub fn window_end(now_ms: i64, window_ms: u64) -> i64 {
        let window_ms = i64::try_from(window_ms.max(1)).unwrap_or(i64::MAX);
        (now_ms.div_euclid(window_ms) + 1).saturating_mul(window_ms)
    }
}

impl RateAlgorithm for FixedWindow {
    fn kind(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn state_key(&self, key: &ProtectionKey, request: &WindowRequest) -> String {
        // Two extra fragments keep counters apart from every plain key.
        let sep = &request.separator;
        format!(
            "{}{sep}fw{sep}{}",
            key,
            Self::window_index(request.now_ms, request.window_ms)
        )
    }

    fn state_ttl_ms(&self, request: &WindowRequest) -> u64 {
        request.window_ms
    }

    fn apply(
        &self,
        state: Option<WindowState>,
        request: &WindowRequest,
    ) -> (WindowState, RateLimitDecision) {
        let previous = match state {
            Some(WindowState::Counter { count }) => count,
            _ => 0,
        };
        // Rejected checks still count, matching INCR on the server.
        let count = previous + 1;

        let reset_at_ms = Self::window_end(request.now_ms, request.window_ms);
        let allowed = count <= request.permits;

        let decision = RateLimitDecision {
            allowed,
            limit: request.permits,
            remaining: request.permits.saturating_sub(count),
            reset_at_ms,
            retry_after_ms: if allowed {
                0
            } else {
                (reset_at_ms - request.now_ms).max(0) as u64
            },
        };
        (WindowState::Counter { count }, decision)
    }

    fn script(&self) -> &'static str {
        SCRIPT
    }
}
