//! Store failure handling.
//!
//! Every protection store call goes through [`FailurePolicy::call`]. A store
//! error never surfaces to the caller as a fault: it becomes an allow or
//! reject verdict per `on_error`, and enough consecutive errors divert later
//! calls to the configured fallback until a probe of the primary succeeds.

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::store::{LocalStore, ProtectionStore};

/// Verdict applied to a single call whose store operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Let the request through and log
    #[default]
    Allow,
    /// Refuse the request
    Reject,
}

/// What replaces the primary store while the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// An in-process store; protection continues per instance
    #[default]
    Memory,
    /// Every call is allowed
    AllowAll,
    /// Every call is rejected
    RejectAll,
    /// Never divert; each call still hits the primary and `on_error` applies
    None,
}

/// Failure handling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureConfig {
    #[serde(default)]
    pub on_error: OnError,

    /// Consecutive errors that open the circuit
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Streak window and probe delay, in seconds
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,

    #[serde(default)]
    pub fallback: FallbackMode,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            on_error: OnError::default(),
            max_errors: default_max_errors(),
            recovery_interval_secs: default_recovery_interval(),
            fallback: FallbackMode::default(),
        }
    }
}

fn default_max_errors() -> u32 {
    5
}

fn default_recovery_interval() -> u64 {
    30
}

impl FailureConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

/// Outcome of a guarded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The store answered
    Value(T),
    /// No answer; treat the request as allowed
    Allow,
    /// No answer; treat the request as rejected
    Reject,
}

impl<T> Guarded<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Guarded::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Where calls are currently routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRoute {
    Primary,
    Memory,
    AllowAll,
    RejectAll,
}

enum Target {
    Primary,
    Fallback(Arc<LocalStore>),
    Verdict(OnError),
}

/// Wraps a primary store with a circuit breaker and fallback.
#[derive(Debug)]
pub struct FailurePolicy {
    primary: Arc<dyn ProtectionStore>,
    fallback: Option<Arc<LocalStore>>,
    config: FailureConfig,
    breaker: CircuitBreaker,
}

impl FailurePolicy {
    pub fn new(primary: Arc<dyn ProtectionStore>, config: FailureConfig, clock: Arc<dyn Clock>) -> Self {
        let fallback = match config.fallback {
            FallbackMode::Memory => Some(Arc::new(LocalStore::with_clock(Arc::clone(&clock)))),
            _ => None,
        };
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: config.max_errors.max(1),
                recovery_interval: config.recovery_interval(),
            },
            clock,
        );
        Self {
            primary,
            fallback,
            config,
            breaker,
        }
    }

    /// A policy that never diverts, for stores that cannot fail.
    pub fn passthrough(primary: Arc<dyn ProtectionStore>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            primary,
            FailureConfig {
                fallback: FallbackMode::None,
                ..Default::default()
            },
            clock,
        )
    }

    pub fn primary(&self) -> &Arc<dyn ProtectionStore> {
        &self.primary
    }

    /// The in-process store used by the memory fallback, if configured.
    pub fn fallback_store(&self) -> Option<&Arc<LocalStore>> {
        self.fallback.as_ref()
    }

    pub fn config(&self) -> &FailureConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current routing, without probing.
    pub fn mode(&self) -> StoreRoute {
        if self.config.fallback == FallbackMode::None || self.breaker.state() == CircuitState::Closed {
            return StoreRoute::Primary;
        }
        match self.config.fallback {
            FallbackMode::Memory => StoreRoute::Memory,
            FallbackMode::AllowAll => StoreRoute::AllowAll,
            FallbackMode::RejectAll => StoreRoute::RejectAll,
            FallbackMode::None => StoreRoute::Primary,
        }
    }

    /// Run `op` against the store calls should currently go to.
    pub async fn call<T, F, Fut>(&self, op: F) -> Guarded<T>
    where
        F: FnOnce(Arc<dyn ProtectionStore>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let (store, on_primary): (Arc<dyn ProtectionStore>, bool) = match self.target().await {
            Target::Primary => (Arc::clone(&self.primary), true),
            Target::Fallback(local) => (local, false),
            Target::Verdict(on_error) => return self.verdict(on_error),
        };

        let backend = store.backend();
        match op(store).await {
            Ok(value) => {
                if on_primary && self.breaker.consecutive_failures() > 0 {
                    self.breaker.record_success();
                }
                Guarded::Value(value)
            }
            Err(e) => {
                warn!(backend = backend, error = %e, on_error = ?self.config.on_error, "Protection store call failed");
                if on_primary && self.breaker.record_failure() {
                    warn!(
                        failures = self.breaker.consecutive_failures(),
                        fallback = ?self.config.fallback,
                        "Circuit opened, diverting store calls"
                    );
                }
                self.verdict(self.config.on_error)
            }
        }
    }

    async fn target(&self) -> Target {
        if self.config.fallback == FallbackMode::None || self.breaker.state() == CircuitState::Closed {
            return Target::Primary;
        }

        if self.breaker.try_begin_probe() {
            match self.primary.ping().await {
                Ok(()) => {
                    self.breaker.record_success();
                    info!(backend = self.primary.backend(), "Primary store recovered, circuit closed");
                    return Target::Primary;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(backend = self.primary.backend(), error = %e, "Recovery probe failed");
                }
            }
        }

        match (self.config.fallback, &self.fallback) {
            (FallbackMode::Memory, Some(local)) => Target::Fallback(Arc::clone(local)),
            (FallbackMode::RejectAll, _) => Target::Verdict(OnError::Reject),
            _ => Target::Verdict(OnError::Allow),
        }
    }

    fn verdict<T>(&self, on_error: OnError) -> Guarded<T> {
        match on_error {
            OnError::Allow => Guarded::Allow,
            OnError::Reject => Guarded::Reject,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{StoreError, StoreResult};
    use crate::key::ProtectionKey;
    use crate::ratelimit::{RateLimitDecision, WindowRequest};
    use crate::store::{ProtectionRecord, ProtectionStore, RecordUpdate, Updated};

    /// A store whose every call fails while `down` is set.
    #[derive(Debug, Default)]
    pub(crate) struct FlakyStore {
        pub down: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl FlakyStore {
        pub fn down() -> Self {
            Self {
                down: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            }
        }

        fn gate(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ProtectionStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn get_or_create(
            &self,
            _key: &ProtectionKey,
            candidate: ProtectionRecord,
            _ttl: Duration,
        ) -> StoreResult<(ProtectionRecord, bool)> {
            self.gate()?;
            Ok((candidate, true))
        }

        async fn compare_and_update(
            &self,
            _key: &ProtectionKey,
            _update: &RecordUpdate,
        ) -> StoreResult<Option<Updated>> {
            self.gate()?;
            Ok(None)
        }

        async fn get(&self, _key: &ProtectionKey) -> StoreResult<Option<ProtectionRecord>> {
            self.gate()?;
            Ok(None)
        }

        async fn delete(&self, _key: &ProtectionKey) -> StoreResult<bool> {
            self.gate()?;
            Ok(false)
        }

        async fn exists(&self, _key: &ProtectionKey) -> StoreResult<bool> {
            self.gate()?;
            Ok(false)
        }

        async fn count_by_prefix(&self, _prefix: &str) -> StoreResult<usize> {
            self.gate()?;
            Ok(0)
        }

        async fn evaluate_window(
            &self,
            _key: &ProtectionKey,
            request: &WindowRequest,
        ) -> StoreResult<RateLimitDecision> {
            self.gate()?;
            Ok(RateLimitDecision::unlimited(request.now_ms))
        }

        async fn ping(&self) -> StoreResult<()> {
            self.gate()
        }
    }
}
