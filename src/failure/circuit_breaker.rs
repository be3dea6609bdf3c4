//! Circuit breaker over consecutive store failures.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{millis_of, Clock};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go to the primary store
    Closed = 0,
    /// The primary store is considered down
    Open = 1,
    /// One probe of the primary store is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Failures further apart than this do not accumulate, and an open
    /// circuit waits this long before probing
    pub recovery_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// Lock-free circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_ms: AtomicI64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_ms: AtomicI64::new(0),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Claim the single recovery probe.
    ///
    /// Succeeds for exactly one caller once an open circuit has waited out
    /// the recovery interval; that caller moves the circuit to half-open and
    /// must report the probe outcome.
    pub fn try_begin_probe(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }
        let elapsed = self
            .clock
            .now_millis()
            .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
        if elapsed < self.recovery_window_ms() {
            return false;
        }
        self.state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn recovery_window_ms(&self) -> i64 {
        i64::try_from(millis_of(self.config.recovery_interval)).unwrap_or(i64::MAX)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() != CircuitState::Closed {
            self.state.store(CircuitState::Closed as u8, Ordering::Release);
        }
    }

    /// Record a failure. Returns true if this call opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = self.clock.now_millis();
        let previous = self.last_failure_ms.swap(now, Ordering::AcqRel);
        let window = self.recovery_window_ms();

        let failures = if previous > 0 && now - previous > window {
            // The earlier streak is too old to count.
            self.consecutive_failures.store(1, Ordering::Release);
            1
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                true
            }
            CircuitState::Closed if failures >= self.config.failure_threshold as u64 => self
                .state
                .compare_exchange(
                    CircuitState::Closed as u8,
                    CircuitState::Open as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            _ => false,
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}
