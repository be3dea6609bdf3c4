//! End-to-end behaviour of the `Protection` facade.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apiguard::clock::{Clock, MockClock};
use apiguard::config::ProtectionConfig;
use apiguard::context::RequestContext;
use apiguard::error::{ConflictReason, StoreError, StoreResult};
use apiguard::failure::{FailureConfig, FallbackMode, OnError, StoreRoute};
use apiguard::idempotency::Admission;
use apiguard::key::{Dimension, KeyBuilder, ProtectionKey};
use apiguard::policy::{
    ConfigResolver, ConflictStrategy, InMemoryOverrideStore, PolicyDeclaration, PolicyDefaults,
    PolicyOverride, PolicySource,
};
use apiguard::ratelimit::{Algorithm, RateLimitDecision, WindowRequest};
use apiguard::store::{LocalStore, ProtectionRecord, ProtectionStore, RecordUpdate, Updated};
use apiguard::{Protection, ProtectionError};
use async_trait::async_trait;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

/// A store that can be switched off, delegating to memory while on.
#[derive(Debug)]
struct SwitchableStore {
    inner: LocalStore,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchableStore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: LocalStore::with_clock(clock),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn guard(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProtectionStore for SwitchableStore {
    fn backend(&self) -> &'static str {
        "switchable"
    }

    async fn get_or_create(
        &self,
        key: &ProtectionKey,
        candidate: ProtectionRecord,
        ttl: Duration,
    ) -> StoreResult<(ProtectionRecord, bool)> {
        self.guard()?;
        self.inner.get_or_create(key, candidate, ttl).await
    }

    async fn compare_and_update(
        &self,
        key: &ProtectionKey,
        update: &RecordUpdate,
    ) -> StoreResult<Option<Updated>> {
        self.guard()?;
        self.inner.compare_and_update(key, update).await
    }

    async fn get(&self, key: &ProtectionKey) -> StoreResult<Option<ProtectionRecord>> {
        self.guard()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &ProtectionKey) -> StoreResult<bool> {
        self.guard()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &ProtectionKey) -> StoreResult<bool> {
        self.guard()?;
        self.inner.exists(key).await
    }

    async fn count_by_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.guard()?;
        self.inner.count_by_prefix(prefix).await
    }

    async fn evaluate_window(
        &self,
        key: &ProtectionKey,
        request: &WindowRequest,
    ) -> StoreResult<RateLimitDecision> {
        self.guard()?;
        self.inner.evaluate_window(key, request).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.guard()
    }
}

fn resolver(clock: Arc<dyn Clock>) -> ConfigResolver {
    let resolver = ConfigResolver::new(
        PolicyDefaults::default(),
        ConflictStrategy::MostRestrictive,
        Arc::new(InMemoryOverrideStore::new()),
        clock,
    );
    resolver
        .register_policy(
            "orders.create",
            PolicyDeclaration::limit(Dimension::User, 10, 60).with_algorithm(Algorithm::FixedWindow),
        )
        .unwrap();
    resolver
}

fn build(failure: FailureConfig) -> (Protection, Arc<SwitchableStore>, MockClock) {
    let clock = MockClock::new(0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(SwitchableStore::new(Arc::clone(&shared)));
    let protection = Protection::new(
        Arc::clone(&store) as Arc<dyn ProtectionStore>,
        resolver(Arc::clone(&shared)),
        failure,
        KeyBuilder::default(),
        shared,
    );
    (protection, store, clock)
}

fn user(name: &str) -> RequestContext {
    RequestContext::new().with_attribute("user", name)
}

#[tokio::test]
async fn test_fixed_window_per_user_scenario() {
    let (protection, _store, clock) = build(FailureConfig::default());
    let alice = user("alice");

    for expected in (0..10).rev() {
        let decision = protection.check_rate_limit("orders.create", &alice).await.unwrap();
        assert_eq!(decision.remaining, expected);
    }
    let err = assert_err!(protection.check_rate_limit("orders.create", &alice).await);
    assert!(matches!(err, ProtectionError::RateLimitExceeded { limit: 10, .. }));
    assert_eq!(err.retry_after_ms(), Some(60_000));

    clock.set(61_000);
    assert_ok!(protection.check_rate_limit("orders.create", &alice).await);
}

#[tokio::test]
async fn test_override_precedence_and_expiry() {
    let (protection, _store, clock) = build(FailureConfig::default());
    let resolver = protection.resolver();

    resolver
        .set_override(
            "orders.create",
            PolicyOverride::new(PolicyDeclaration {
                permits: Some(1),
                ..Default::default()
            })
            .expiring_at(10_000),
        )
        .await
        .unwrap();

    let policy = resolver.resolve("orders.create").await.unwrap();
    assert_eq!(policy.permits, 1);
    assert_eq!(policy.source, PolicySource::Override);

    let bob = user("bob");
    assert_ok!(protection.check_rate_limit("orders.create", &bob).await);
    assert_err!(protection.check_rate_limit("orders.create", &bob).await);

    clock.set(10_000);
    resolver.invalidate_cache();
    let policy = resolver.resolve("orders.create").await.unwrap();
    assert_eq!(policy.permits, 10);
    assert_eq!(policy.source, PolicySource::Declared);
}

#[tokio::test]
async fn test_idempotency_round_trip() {
    let (protection, _store, _clock) = build(FailureConfig::default());
    let carol = user("carol");
    let args = [json!({"order": "A-1"})];

    let (key, admission) = protection.begin_idempotent("orders.pay", &carol, &args).await.unwrap();
    assert_eq!(admission, Admission::Execute);

    // A concurrent repeat sees the call in progress.
    let err = assert_err!(protection.begin_idempotent("orders.pay", &carol, &args).await);
    match err {
        ProtectionError::IdempotencyConflict { reason, retry_after_ms, .. } => {
            assert_eq!(reason, ConflictReason::InProgress);
            assert_eq!(retry_after_ms, 300_000);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(protection.complete(&key, Some("{\"id\":1}".into())).await.unwrap());
    let (_, admission) = protection.begin_idempotent("orders.pay", &carol, &args).await.unwrap();
    assert_eq!(admission, Admission::Replay("{\"id\":1}".into()));

    let record = protection.idempotency_record(&key).await.unwrap().unwrap();
    assert_eq!(record.access_count, 2);

    assert!(protection.invalidate(&key).await.unwrap());
    let (_, admission) = protection.begin_idempotent("orders.pay", &carol, &args).await.unwrap();
    assert_eq!(admission, Admission::Execute);
}

#[tokio::test]
async fn test_idempotency_retry_after_failure() {
    let (protection, _store, _clock) = build(FailureConfig::default());
    let dave = user("dave");
    let args = [json!(7)];

    let (key, _) = protection.begin_idempotent("orders.pay", &dave, &args).await.unwrap();
    assert!(protection.fail(&key, "card declined").await.unwrap());

    let (_, admission) = protection.begin_idempotent("orders.pay", &dave, &args).await.unwrap();
    assert_eq!(admission, Admission::Execute);
}

#[tokio::test]
async fn test_duplicate_window() {
    let (protection, _store, clock) = build(FailureConfig::default());
    let erin = user("erin");
    let args = [json!({"amount": 5})];

    assert_ok!(protection.submit("transfer", &erin, &args).await);
    clock.advance(Duration::from_millis(1_500));
    let err = assert_err!(protection.submit("transfer", &erin, &args).await);
    assert_eq!(err.retry_after_ms(), Some(3_500));

    clock.advance(Duration::from_millis(3_500));
    assert_ok!(protection.submit("transfer", &erin, &args).await);
}

#[tokio::test]
async fn test_store_outage_allows_by_default() {
    let config = FailureConfig {
        fallback: FallbackMode::None,
        ..Default::default()
    };
    let (protection, store, _clock) = build(config);
    store.set_down(true);

    for _ in 0..20 {
        assert_ok!(protection.check_rate_limit("orders.create", &user("frank")).await);
    }
    assert_ok!(protection.submit("transfer", &user("frank"), &[json!(1)]).await);
    assert_ok!(protection.submit("transfer", &user("frank"), &[json!(1)]).await);
    assert_eq!(protection.route(), StoreRoute::Primary);
}

#[tokio::test]
async fn test_store_outage_rejects_when_configured() {
    let config = FailureConfig {
        on_error: OnError::Reject,
        fallback: FallbackMode::None,
        ..Default::default()
    };
    let (protection, store, _clock) = build(config);
    store.set_down(true);

    let err = assert_err!(protection.check_rate_limit("orders.create", &user("gina")).await);
    assert!(err.is_rejection());

    let err = assert_err!(protection.begin_idempotent("orders.pay", &user("gina"), &[]).await);
    assert!(matches!(
        err,
        ProtectionError::IdempotencyConflict {
            reason: ConflictReason::StoreUnavailable,
            ..
        }
    ));
}

#[tokio::test]
async fn test_memory_fallback_and_recovery() {
    let config = FailureConfig {
        max_errors: 2,
        recovery_interval_secs: 30,
        ..Default::default()
    };
    let (protection, store, clock) = build(config);
    let hank = user("hank");
    store.set_down(true);

    for _ in 0..2 {
        assert_ok!(protection.check_rate_limit("orders.create", &hank).await);
    }
    assert_eq!(protection.route(), StoreRoute::Memory);

    // Limits keep applying from the in-process fallback.
    let calls = store.calls.load(Ordering::SeqCst);
    for _ in 0..10 {
        assert_ok!(protection.check_rate_limit("orders.create", &hank).await);
    }
    assert_err!(protection.check_rate_limit("orders.create", &hank).await);
    assert_eq!(store.calls.load(Ordering::SeqCst), calls);

    store.set_down(false);
    clock.advance(Duration::from_secs(31));
    assert_ok!(protection.check_rate_limit("orders.create", &hank).await);
    assert_eq!(protection.route(), StoreRoute::Primary);
}

#[tokio::test]
async fn test_from_config_wires_policies() {
    let config = ProtectionConfig::from_yaml(
        r#"
store:
  key_prefix: it
defaults:
  permits: 2
  window_secs: 10
policies:
  reports.export:
    - dimension: user
      permits: 1
      window_secs: 60
      message: "one export per minute"
"#,
    )
    .unwrap();
    let protection = Protection::from_config(&config).await.unwrap();
    let ivan = user("ivan");

    assert_ok!(protection.check_rate_limit("reports.export", &ivan).await);
    match assert_err!(protection.check_rate_limit("reports.export", &ivan).await) {
        ProtectionError::RateLimitExceeded { key, message, .. } => {
            assert_eq!(key, "it:rl:user:ivan:reports.export");
            assert_eq!(message, "one export per minute");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Undeclared operations get the defaults.
    let anon = RequestContext::new();
    assert_ok!(protection.check_rate_limit("reports.list", &anon).await);
    assert_ok!(protection.check_rate_limit("reports.list", &anon).await);
    assert_err!(protection.check_rate_limit("reports.list", &anon).await);
}
