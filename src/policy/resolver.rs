//! Effective policy resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{
    ConflictStrategy, EffectivePolicy, OverrideStore, PolicyDeclaration, PolicyDefaults,
    PolicyOverride, PolicySource,
};
use crate::clock::{millis_of, Clock};
use crate::error::{ProtectionError, Result};
use crate::key::Dimension;

#[derive(Debug, Clone)]
struct CachedOverride {
    value: Option<PolicyOverride>,
    fetched_at_ms: i64,
}

/// Resolves the effective policy for an operation.
///
/// Overrides are cached per operation for at most `cache_ttl`; writes through
/// this resolver invalidate the cache immediately, writes made directly to
/// the override store become visible once the cached entry ages out.
#[derive(Debug)]
pub struct ConfigResolver {
    defaults: PolicyDefaults,
    strategy: ConflictStrategy,
    declarations: RwLock<HashMap<String, Vec<PolicyDeclaration>>>,
    overrides: Arc<dyn OverrideStore>,
    cache: DashMap<String, CachedOverride>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ConfigResolver {
    pub fn new(
        defaults: PolicyDefaults,
        strategy: ConflictStrategy,
        overrides: Arc<dyn OverrideStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            defaults,
            strategy,
            declarations: RwLock::new(HashMap::new()),
            overrides,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(30),
            clock,
        }
    }

    /// Bound on how stale a cached override may be. Zero disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn defaults(&self) -> &PolicyDefaults {
        &self.defaults
    }

    pub fn conflict_strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn overrides(&self) -> &Arc<dyn OverrideStore> {
        &self.overrides
    }

    /// Register a static declaration for `operation_id`.
    ///
    /// Under [`ConflictStrategy::FailFast`] a GLOBAL declaration that
    /// disagrees with an earlier one is refused.
    pub fn register_policy(&self, operation_id: &str, declaration: PolicyDeclaration) -> Result<()> {
        let mut declarations = self.declarations.write();
        let list = declarations.entry(operation_id.to_string()).or_default();
        list.push(declaration);

        if self.strategy == ConflictStrategy::FailFast {
            if let Err(e) = self.pick(operation_id, list) {
                list.pop();
                if list.is_empty() {
                    declarations.remove(operation_id);
                }
                return Err(e);
            }
        }

        info!(operation = operation_id, "Registered protection policy");
        Ok(())
    }

    /// Static declarations registered for `operation_id`, in order.
    pub fn declarations(&self, operation_id: &str) -> Vec<PolicyDeclaration> {
        self.declarations
            .read()
            .get(operation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Operation ids with at least one declaration.
    pub fn operations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.declarations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn dimension_of(&self, declaration: &PolicyDeclaration) -> Dimension {
        declaration.dimension.unwrap_or(self.defaults.dimension)
    }

    /// Choose the declaration that applies among those registered.
    fn pick(&self, operation_id: &str, list: &[PolicyDeclaration]) -> Result<Option<PolicyDeclaration>> {
        let (first, rest) = match list.split_first() {
            Some(split) => split,
            None => return Ok(None),
        };
        if rest.is_empty() {
            return Ok(Some(first.clone()));
        }

        let global = list
            .iter()
            .any(|d| self.dimension_of(d) == Dimension::Global);
        if !global {
            return Ok(list.last().cloned());
        }

        let quota = first.quota(&self.defaults);
        if rest.iter().all(|d| d.quota(&self.defaults) == quota) {
            return Ok(Some(first.clone()));
        }

        let sites: Vec<&str> = list
            .iter()
            .map(|d| d.site.as_deref().unwrap_or("<unnamed>"))
            .collect();

        let chosen = match self.strategy {
            ConflictStrategy::FailFast => {
                return Err(ProtectionError::Configuration(format!(
                    "conflicting global policies for '{}' declared at {}",
                    operation_id,
                    sites.join(", ")
                )));
            }
            ConflictStrategy::First => first,
            ConflictStrategy::MostRestrictive => list
                .iter()
                .min_by(|a, b| a.rate(&self.defaults).total_cmp(&b.rate(&self.defaults)))
                .unwrap_or(first),
            ConflictStrategy::LeastRestrictive => list
                .iter()
                .max_by(|a, b| a.rate(&self.defaults).total_cmp(&b.rate(&self.defaults)))
                .unwrap_or(first),
        };

        debug!(
            operation = operation_id,
            strategy = ?self.strategy,
            chosen = chosen.site.as_deref().unwrap_or("<unnamed>"),
            candidates = sites.len(),
            "Resolved global policy conflict"
        );
        Ok(Some(chosen.clone()))
    }

    async fn active_override(&self, operation_id: &str) -> Option<PolicyOverride> {
        let now = self.clock.now_millis();
        let cached = self.cache.get(operation_id).and_then(|entry| {
            let ttl_ms = i64::try_from(millis_of(self.cache_ttl)).unwrap_or(i64::MAX);
            let fresh = now.saturating_sub(entry.fetched_at_ms) < ttl_ms;
            fresh.then(|| entry.value.clone())
        });

        let value = match cached {
            Some(value) => value,
            None => {
                let loaded = match self.overrides.load(operation_id).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(operation = operation_id, error = %e, "Failed to load policy override, ignoring it");
                        None
                    }
                };
                self.cache.insert(
                    operation_id.to_string(),
                    CachedOverride {
                        value: loaded.clone(),
                        fetched_at_ms: now,
                    },
                );
                loaded
            }
        };

        match value {
            Some(ov) if ov.is_expired(now) => {
                debug!(operation = operation_id, "Discarding expired policy override");
                self.cache.remove(operation_id);
                if let Err(e) = self.overrides.remove(operation_id).await {
                    warn!(operation = operation_id, error = %e, "Failed to delete expired override");
                }
                None
            }
            other => other,
        }
    }

    /// Resolve override > declaration > defaults for `operation_id`.
    pub async fn resolve(&self, operation_id: &str) -> Result<EffectivePolicy> {
        let mut policy = EffectivePolicy::from_defaults(operation_id, &self.defaults);

        let declared = {
            let declarations = self.declarations.read();
            match declarations.get(operation_id) {
                Some(list) => self.pick(operation_id, list)?,
                None => None,
            }
        };
        if let Some(declaration) = declared {
            policy.apply(&declaration, PolicySource::Declared);
        }

        if let Some(ov) = self.active_override(operation_id).await {
            policy.apply(&ov.declaration, PolicySource::Override);
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Install or replace the dynamic override for `operation_id`.
    pub async fn set_override(&self, operation_id: &str, policy: PolicyOverride) -> Result<()> {
        let mut candidate = EffectivePolicy::from_defaults(operation_id, &self.defaults);
        candidate.apply(&policy.declaration, PolicySource::Override);
        candidate.validate()?;

        self.overrides.save(operation_id, policy).await?;
        self.cache.remove(operation_id);
        info!(operation = operation_id, "Policy override set");
        Ok(())
    }

    /// Remove the dynamic override for `operation_id`.
    pub async fn remove_override(&self, operation_id: &str) -> Result<bool> {
        let removed = self.overrides.remove(operation_id).await?;
        self.cache.remove(operation_id);
        if removed {
            info!(operation = operation_id, "Policy override removed");
        }
        Ok(removed)
    }

    /// Drop every cached override.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// Check every registered operation resolves to a usable policy.
    pub fn validate(&self) -> Result<()> {
        let declarations = self.declarations.read();
        for (operation_id, list) in declarations.iter() {
            let mut policy = EffectivePolicy::from_defaults(operation_id, &self.defaults);
            if let Some(declaration) = self.pick(operation_id, list)? {
                policy.apply(&declaration, PolicySource::Declared);
            }
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::{StoreError, StoreResult};
    use crate::policy::InMemoryOverrideStore;
    use async_trait::async_trait;

    fn setup(strategy: ConflictStrategy) -> (ConfigResolver, Arc<InMemoryOverrideStore>, MockClock) {
        let clock = MockClock::new(0);
        let store = Arc::new(InMemoryOverrideStore::new());
        let resolver = ConfigResolver::new(
            PolicyDefaults::default(),
            strategy,
            store.clone(),
            Arc::new(clock.clone()),
        );
        (resolver, store, clock)
    }

    #[tokio::test]
    async fn test_precedence_and_override_expiry() {
        let (resolver, store, clock) = setup(ConflictStrategy::default());
        resolver
            .register_policy("orders", PolicyDeclaration::limit(Dimension::User, 10, 60))
            .unwrap();
        resolver
            .set_override(
                "orders",
                PolicyOverride::new(PolicyDeclaration {
                    permits: Some(2),
                    ..Default::default()
                })
                .expiring_at(5_000),
            )
            .await
            .unwrap();

        let policy = resolver.resolve("orders").await.unwrap();
        assert_eq!(policy.permits, 2);
        assert_eq!(policy.dimension, Dimension::User);
        assert_eq!(policy.source, PolicySource::Override);

        clock.set(5_000);
        let policy = resolver.resolve("orders").await.unwrap();
        assert_eq!(policy.permits, 10);
        assert_eq!(policy.source, PolicySource::Declared);
        // Deleted lazily on read
        assert!(store.load("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_defaults_when_undeclared() {
        let (resolver, _, _) = setup(ConflictStrategy::default());
        let policy = resolver.resolve("unknown").await.unwrap();
        assert_eq!(policy.source, PolicySource::Default);
        assert_eq!(policy.permits, 100);
    }

    #[tokio::test]
    async fn test_cache_staleness_bound() {
        let (resolver, store, clock) = setup(ConflictStrategy::default());
        let resolver = resolver.with_cache_ttl(Duration::from_secs(10));
        assert_eq!(resolver.resolve("op").await.unwrap().permits, 100);

        // Written behind the resolver's back
        store
            .save(
                "op",
                PolicyOverride::new(PolicyDeclaration {
                    permits: Some(1),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(resolver.resolve("op").await.unwrap().permits, 100);

        clock.advance(Duration::from_secs(10));
        assert_eq!(resolver.resolve("op").await.unwrap().permits, 1);

        assert!(resolver.remove_override("op").await.unwrap());
        assert_eq!(resolver.resolve("op").await.unwrap().permits, 100);
    }

    #[tokio::test]
    async fn test_global_conflict_strategies() {
        let strict = PolicyDeclaration::limit(Dimension::Global, 10, 60).at("a");
        let loose = PolicyDeclaration::limit(Dimension::Global, 50, 60).at("b");

        for (strategy, expected) in [
            (ConflictStrategy::MostRestrictive, 10),
            (ConflictStrategy::LeastRestrictive, 50),
            (ConflictStrategy::First, 50),
        ] {
            let (resolver, _, _) = setup(strategy);
            resolver.register_policy("shared", loose.clone()).unwrap();
            resolver.register_policy("shared", strict.clone()).unwrap();
            assert_eq!(resolver.resolve("shared").await.unwrap().permits, expected);
        }
    }

    #[tokio::test]
    async fn test_fail_fast_rejects_conflict_at_registration() {
        let (resolver, _, _) = setup(ConflictStrategy::FailFast);
        resolver
            .register_policy("shared", PolicyDeclaration::limit(Dimension::Global, 10, 60).at("a"))
            .unwrap();
        // Identical quotas are not a conflict
        resolver
            .register_policy("shared", PolicyDeclaration::limit(Dimension::Global, 10, 60).at("b"))
            .unwrap();

        let err = resolver
            .register_policy("shared", PolicyDeclaration::limit(Dimension::Global, 20, 60).at("c"))
            .unwrap_err();
        assert!(err.to_string().contains("a, b, c"));
        assert_eq!(resolver.declarations("shared").len(), 2);
        assert!(resolver.validate().is_ok());
    }

    #[tokio::test]
    async fn test_non_global_last_registration_wins() {
        let (resolver, _, _) = setup(ConflictStrategy::FailFast);
        resolver
            .register_policy("op", PolicyDeclaration::limit(Dimension::Ip, 10, 60))
            .unwrap();
        resolver
            .register_policy("op", PolicyDeclaration::limit(Dimension::Ip, 20, 60))
            .unwrap();
        assert_eq!(resolver.resolve("op").await.unwrap().permits, 20);
    }

    #[tokio::test]
    async fn test_invalid_override_refused() {
        let (resolver, _, _) = setup(ConflictStrategy::default());
        let err = resolver
            .set_override(
                "op",
                PolicyOverride::new(PolicyDeclaration {
                    window_secs: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtectionError::Configuration(_)));
    }

    #[derive(Debug)]
    struct BrokenOverrides;

    #[async_trait]
    impl OverrideStore for BrokenOverrides {
        async fn load(&self, _operation_id: &str) -> StoreResult<Option<PolicyOverride>> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn save(&self, _operation_id: &str, _policy: PolicyOverride) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn remove(&self, _operation_id: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn list(&self) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_override_store_failure_falls_back_to_declaration() {
        let resolver = ConfigResolver::new(
            PolicyDefaults::default(),
            ConflictStrategy::default(),
            Arc::new(BrokenOverrides),
            Arc::new(MockClock::new(0)),
        );
        resolver
            .register_policy("op", PolicyDeclaration::limit(Dimension::Api, 7, 60))
            .unwrap();
        let policy = resolver.resolve("op").await.unwrap();
        assert_eq!(policy.permits, 7);
        assert_eq!(policy.source, PolicySource::Declared);
    }
}
