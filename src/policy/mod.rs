//! Policy declarations and resolution.
//!
//! A policy is resolved per operation id by layering, lowest first:
//! [`PolicyDefaults`], the registered [`PolicyDeclaration`], and a dynamic
//! [`PolicyOverride`]. Every declaration field is optional so each layer only
//! replaces what it sets.

mod overrides;
mod resolver;

pub use overrides::{InMemoryOverrideStore, OverrideStore};
pub use resolver::ConfigResolver;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duplicate::DuplicatePolicy;
use crate::error::{ProtectionError, Result};
use crate::idempotency::IdempotencyPolicy;
use crate::key::{Dimension, IdempotencyKeySource};
use crate::ratelimit::{Algorithm, AlgorithmParams, ExceedStrategy, LimitSpec, MAX_WINDOW_SECS};

/// Policy attached to an operation, as data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDeclaration {
    pub enabled: Option<bool>,
    pub dimension: Option<Dimension>,
    pub permits: Option<u64>,
    pub window_secs: Option<u64>,
    pub algorithm: Option<Algorithm>,
    pub strategy: Option<ExceedStrategy>,
    pub queue_timeout_ms: Option<u64>,
    /// Token/leaky bucket capacity
    pub capacity: Option<f64>,
    /// Token refill or leak rate per second
    pub refill_rate: Option<f64>,
    pub idempotency_timeout_secs: Option<u64>,
    pub duplicate_interval_secs: Option<u64>,
    pub replay_result: Option<bool>,
    pub cache_result: Option<bool>,
    pub retry_on_failure: Option<bool>,
    /// Expression for the custom dimension and duplicate-guard keys
    pub key_expression: Option<String>,
    pub idempotency_key: Option<IdempotencyKeySource>,
    /// Rejection message for every mechanism on this operation
    pub message: Option<String>,
    /// Where the declaration came from, for conflict reports
    pub site: Option<String>,
}

impl PolicyDeclaration {
    /// A rate limit declaration.
    pub fn limit(dimension: Dimension, permits: u64, window_secs: u64) -> Self {
        Self {
            dimension: Some(dimension),
            permits: Some(permits),
            window_secs: Some(window_secs),
            ..Default::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn at(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Permits per second after filling gaps from `defaults`; lower is
    /// more restrictive.
    pub(crate) fn rate(&self, defaults: &PolicyDefaults) -> f64 {
        let permits = self.permits.unwrap_or(defaults.permits) as f64;
        let window = self.window_secs.unwrap_or(defaults.window_secs).max(1) as f64;
        permits / window
    }

    pub(crate) fn quota(&self, defaults: &PolicyDefaults) -> (u64, u64) {
        (
            self.permits.unwrap_or(defaults.permits),
            self.window_secs.unwrap_or(defaults.window_secs),
        )
    }
}

/// A dynamic override, optionally expiring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(flatten)]
    pub declaration: PolicyDeclaration,
    /// Epoch ms after which the override no longer applies
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
}

impl PolicyOverride {
    pub fn new(declaration: PolicyDeclaration) -> Self {
        Self {
            declaration,
            expires_at_ms: None,
        }
    }

    pub fn expiring_at(mut self, expires_at_ms: i64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// System-wide defaults, the lowest layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefaults {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub dimension: Dimension,

    #[serde(default = "default_permits")]
    pub permits: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default)]
    pub strategy: ExceedStrategy,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default = "default_idempotency_timeout_secs")]
    pub idempotency_timeout_secs: u64,

    #[serde(default = "default_duplicate_interval_secs")]
    pub duplicate_interval_secs: u64,

    #[serde(default = "default_true")]
    pub replay_result: bool,

    #[serde(default = "default_true")]
    pub cache_result: bool,

    #[serde(default = "default_true")]
    pub retry_on_failure: bool,

    #[serde(default = "default_rate_limit_message")]
    pub rate_limit_message: String,

    #[serde(default = "default_idempotency_message")]
    pub idempotency_message: String,

    #[serde(default = "default_duplicate_message")]
    pub duplicate_message: String,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            dimension: Dimension::default(),
            permits: default_permits(),
            window_secs: default_window_secs(),
            algorithm: Algorithm::default(),
            strategy: ExceedStrategy::default(),
            queue_timeout_ms: default_queue_timeout_ms(),
            idempotency_timeout_secs: default_idempotency_timeout_secs(),
            duplicate_interval_secs: default_duplicate_interval_secs(),
            replay_result: true,
            cache_result: true,
            retry_on_failure: true,
            rate_limit_message: default_rate_limit_message(),
            idempotency_message: default_idempotency_message(),
            duplicate_message: default_duplicate_message(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_permits() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_queue_timeout_ms() -> u64 {
    1000
}

fn default_idempotency_timeout_secs() -> u64 {
    300
}

fn default_duplicate_interval_secs() -> u64 {
    5
}

fn default_rate_limit_message() -> String {
    "Too many requests".to_string()
}

fn default_idempotency_message() -> String {
    "Request already processed or in progress".to_string()
}

fn default_duplicate_message() -> String {
    "Duplicate submission, please wait".to_string()
}

/// How differing declarations of one GLOBAL policy are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Lowest permits-per-second wins
    #[default]
    MostRestrictive,
    /// Highest permits-per-second wins
    LeastRestrictive,
    /// The first registered declaration wins
    First,
    /// Refuse to start
    FailFast,
}

/// Which layer decided a resolved policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Default,
    Declared,
    Override,
}

/// Resolved configuration for one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub operation_id: String,
    pub enabled: bool,
    pub dimension: Dimension,
    pub permits: u64,
    pub window_secs: u64,
    pub algorithm: Algorithm,
    pub params: AlgorithmParams,
    pub strategy: ExceedStrategy,
    pub queue_timeout: Duration,
    pub idempotency_timeout: Duration,
    pub duplicate_interval: Duration,
    pub replay_result: bool,
    pub cache_result: bool,
    pub retry_on_failure: bool,
    pub key_expression: Option<String>,
    pub idempotency_key: IdempotencyKeySource,
    pub rate_limit_message: String,
    pub idempotency_message: String,
    pub duplicate_message: String,
    pub source: PolicySource,
}

impl EffectivePolicy {
    /// The default layer for `operation_id`.
    pub fn from_defaults(operation_id: &str, defaults: &PolicyDefaults) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            enabled: defaults.enabled,
            dimension: defaults.dimension,
            permits: defaults.permits,
            window_secs: defaults.window_secs,
            algorithm: defaults.algorithm,
            params: AlgorithmParams::default(),
            strategy: defaults.strategy,
            queue_timeout: Duration::from_millis(defaults.queue_timeout_ms),
            idempotency_timeout: Duration::from_secs(defaults.idempotency_timeout_secs),
            duplicate_interval: Duration::from_secs(defaults.duplicate_interval_secs),
            replay_result: defaults.replay_result,
            cache_result: defaults.cache_result,
            retry_on_failure: defaults.retry_on_failure,
            key_expression: None,
            idempotency_key: IdempotencyKeySource::default(),
            rate_limit_message: defaults.rate_limit_message.clone(),
            idempotency_message: defaults.idempotency_message.clone(),
            duplicate_message: defaults.duplicate_message.clone(),
            source: PolicySource::Default,
        }
    }

    /// Lay `layer` over the current values.
    pub fn apply(&mut self, layer: &PolicyDeclaration, source: PolicySource) {
        if let Some(enabled) = layer.enabled {
            self.enabled = enabled;
        }
        if let Some(dimension) = layer.dimension {
            self.dimension = dimension;
        }
        if let Some(permits) = layer.permits {
            self.permits = permits;
        }
        if let Some(window_secs) = layer.window_secs {
            self.window_secs = window_secs;
        }
        if let Some(algorithm) = layer.algorithm {
            self.algorithm = algorithm;
        }
        if let Some(strategy) = layer.strategy {
            self.strategy = strategy;
        }
        if let Some(ms) = layer.queue_timeout_ms {
            self.queue_timeout = Duration::from_millis(ms);
        }
        if layer.capacity.is_some() {
            self.params.capacity = layer.capacity;
        }
        if layer.refill_rate.is_some() {
            self.params.refill_rate = layer.refill_rate;
        }
        if let Some(secs) = layer.idempotency_timeout_secs {
            self.idempotency_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = layer.duplicate_interval_secs {
            self.duplicate_interval = Duration::from_secs(secs);
        }
        if let Some(replay) = layer.replay_result {
            self.replay_result = replay;
        }
        if let Some(cache) = layer.cache_result {
            self.cache_result = cache;
        }
        if let Some(retry) = layer.retry_on_failure {
            self.retry_on_failure = retry;
        }
        if let Some(expr) = &layer.key_expression {
            self.key_expression = Some(expr.clone());
        }
        if let Some(source) = &layer.idempotency_key {
            self.idempotency_key = source.clone();
        }
        if let Some(message) = &layer.message {
            self.rate_limit_message = message.clone();
            self.idempotency_message = message.clone();
            self.duplicate_message = message.clone();
        }
        self.source = source;
    }

    pub fn limit_spec(&self) -> LimitSpec {
        LimitSpec {
            permits: self.permits,
            window_secs: self.window_secs,
            algorithm: self.algorithm,
            params: self.params,
            strategy: self.strategy,
            queue_timeout: self.queue_timeout,
        }
    }

    pub fn idempotency(&self) -> IdempotencyPolicy {
        IdempotencyPolicy {
            timeout: self.idempotency_timeout,
            replay_result: self.replay_result,
            cache_result: self.cache_result,
            retry_on_failure: self.retry_on_failure,
            message: self.idempotency_message.clone(),
        }
    }

    pub fn duplicate(&self) -> DuplicatePolicy {
        DuplicatePolicy {
            interval: self.duplicate_interval,
            message: self.duplicate_message.clone(),
        }
    }

    /// Reject values no mechanism can run with.
    pub fn validate(&self) -> Result<()> {
        self.limit_spec().validate().map_err(|e| match e {
            ProtectionError::Configuration(msg) => {
                ProtectionError::Configuration(format!("{}: {}", self.operation_id, msg))
            }
            other => other,
        })?;
        let longest = Duration::from_secs(MAX_WINDOW_SECS);
        if self.idempotency_timeout.is_zero() || self.idempotency_timeout > longest {
            return Err(ProtectionError::Configuration(format!(
                "{}: idempotency timeout must be between 1 and {} seconds",
                self.operation_id, MAX_WINDOW_SECS
            )));
        }
        if self.duplicate_interval.is_zero() || self.duplicate_interval > longest {
            return Err(ProtectionError::Configuration(format!(
                "{}: duplicate interval must be between 1 and {} seconds",
                self.operation_id, MAX_WINDOW_SECS
            )));
        }
        if self.dimension == Dimension::Custom && self.key_expression.is_none() {
            return Err(ProtectionError::Configuration(format!(
                "{}: custom dimension requires a key expression",
                self.operation_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layering_only_replaces_set_fields() {
        let defaults = PolicyDefaults::default();
        let mut policy = EffectivePolicy::from_defaults("orders.create", &defaults);
        policy.apply(
            &PolicyDeclaration::limit(Dimension::User, 10, 60),
            PolicySource::Declared,
        );
        policy.apply(
            &PolicyDeclaration {
                permits: Some(3),
                message: Some("slow down".into()),
                ..Default::default()
            },
            PolicySource::Override,
        );

        assert_eq!(policy.dimension, Dimension::User);
        assert_eq!(policy.permits, 3);
        assert_eq!(policy.window_secs, 60);
        assert_eq!(policy.algorithm, Algorithm::SlidingWindow);
        assert_eq!(policy.duplicate_message, "slow down");
        assert_eq!(policy.source, PolicySource::Override);
    }

    #[test]
    fn test_declaration_yaml() {
        let yaml = r#"
dimension: ip
permits: 20
window_secs: 10
algorithm: token_bucket
capacity: 40
idempotency_key:
  type: expression
  expression: "${args.0}"
"#;
        let decl: PolicyDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.dimension, Some(Dimension::Ip));
        assert_eq!(decl.algorithm, Some(Algorithm::TokenBucket));
        assert_eq!(decl.capacity, Some(40.0));
        assert_eq!(
            decl.idempotency_key,
            Some(IdempotencyKeySource::Expression("${args.0}".into()))
        );
        assert_eq!(decl.strategy, None);
    }

    #[test]
    fn test_override_expiry() {
        let ov = PolicyOverride::new(PolicyDeclaration::default()).expiring_at(1_000);
        assert!(!ov.is_expired(999));
        assert!(ov.is_expired(1_000));
        assert!(!PolicyOverride::default().is_expired(i64::MAX));
    }

    #[test]
    fn test_validate() {
        let defaults = PolicyDefaults::default();
        let mut policy = EffectivePolicy::from_defaults("op", &defaults);
        assert!(policy.validate().is_ok());

        policy.dimension = Dimension::Custom;
        assert!(policy.validate().is_err());
        policy.key_expression = Some("${user}".into());
        assert!(policy.validate().is_ok());

        policy.permits = 0;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("op:"));
    }

    #[test]
    fn test_validate_bounds_durations_and_rates() {
        let defaults = PolicyDefaults::default();
        let base = EffectivePolicy::from_defaults("op", &defaults);

        let mut policy = base.clone();
        policy.window_secs = u64::MAX / 100;
        assert!(matches!(policy.validate(), Err(ProtectionError::Configuration(_))));

        let mut policy = base.clone();
        policy.algorithm = Algorithm::TokenBucket;
        policy.params.refill_rate = Some(1e-20);
        assert!(matches!(policy.validate(), Err(ProtectionError::Configuration(_))));

        let mut policy = base.clone();
        policy.idempotency_timeout = Duration::from_secs(u64::MAX);
        assert!(matches!(policy.validate(), Err(ProtectionError::Configuration(_))));

        let mut policy = base.clone();
        policy.duplicate_interval = Duration::from_secs(MAX_WINDOW_SECS + 1);
        assert!(matches!(policy.validate(), Err(ProtectionError::Configuration(_))));

        let mut policy = base;
        policy.window_secs = MAX_WINDOW_SECS;
        policy.idempotency_timeout = Duration::from_secs(MAX_WINDOW_SECS);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_restrictiveness() {
        let defaults = PolicyDefaults::default();
        let strict = PolicyDeclaration::limit(Dimension::Global, 10, 60);
        let loose = PolicyDeclaration::limit(Dimension::Global, 10, 1);
        assert!(strict.rate(&defaults) < loose.rate(&defaults));
    }
}
