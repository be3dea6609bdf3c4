//! The `Protection` facade.
//!
//! Each entry point resolves the operation's effective policy, derives the
//! protection key for the request and runs the matching mechanism. All store
//! traffic goes through one shared [`FailurePolicy`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Backend, ProtectionConfig};
use crate::context::{ExpressionEvaluator, RequestContext, ResolverChain, TemplateEvaluator};
use crate::duplicate::DuplicateGuard;
use crate::error::{ProtectionError, Result};
use crate::failure::{FailureConfig, FailurePolicy, StoreRoute};
use crate::idempotency::{Admission, IdempotencyManager, IdempotencyRecord};
use crate::key::{expression_vars, hash_arguments, Dimension, KeyBuilder, ProtectionKey};
use crate::policy::{ConfigResolver, EffectivePolicy, InMemoryOverrideStore};
use crate::ratelimit::{AlgorithmEngine, RateLimitDecision};
use crate::store::{DistributedStore, LocalStore, ProtectionStore, SweeperHandle};

/// Keyspace of rate limit state.
pub const RATE_LIMIT_NAMESPACE: &str = "rl";
/// Keyspace of idempotency records.
pub const IDEMPOTENCY_NAMESPACE: &str = "idem";
/// Keyspace of duplicate-submission windows.
pub const DUPLICATE_NAMESPACE: &str = "dup";

/// Rate limiting, idempotency and duplicate suppression behind one handle.
pub struct Protection {
    resolver: Arc<ConfigResolver>,
    failure: Arc<FailurePolicy>,
    engine: AlgorithmEngine,
    idempotency: IdempotencyManager,
    duplicates: DuplicateGuard,
    keys: KeyBuilder,
    rate_keys: KeyBuilder,
    idempotency_keys: KeyBuilder,
    duplicate_keys: KeyBuilder,
    resolvers: ResolverChain,
    evaluator: Arc<dyn ExpressionEvaluator>,
    clock: Arc<dyn Clock>,
    sweepers: Vec<SweeperHandle>,
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protection")
            .field("backend", &self.failure.primary().backend())
            .field("prefix", &self.keys.prefix())
            .field("route", &self.failure.mode())
            .field("sweepers", &self.sweepers.len())
            .finish()
    }
}

impl Protection {
    /// Assemble the mechanisms over `store`.
    ///
    /// No background tasks are started; see [`Protection::from_config`].
    pub fn new(
        store: Arc<dyn ProtectionStore>,
        resolver: ConfigResolver,
        failure: FailureConfig,
        keys: KeyBuilder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let failure = Arc::new(FailurePolicy::new(store, failure, Arc::clone(&clock)));
        Self {
            resolver: Arc::new(resolver),
            engine: AlgorithmEngine::new(Arc::clone(&failure), Arc::clone(&clock))
                .with_separator(keys.separator()),
            idempotency: IdempotencyManager::new(Arc::clone(&failure), Arc::clone(&clock)),
            duplicates: DuplicateGuard::new(Arc::clone(&failure), Arc::clone(&clock)),
            failure,
            rate_keys: keys.namespace(RATE_LIMIT_NAMESPACE),
            idempotency_keys: keys.namespace(IDEMPOTENCY_NAMESPACE),
            duplicate_keys: keys.namespace(DUPLICATE_NAMESPACE),
            keys,
            resolvers: ResolverChain::standard(),
            evaluator: Arc::new(TemplateEvaluator),
            clock,
            sweepers: Vec::new(),
        }
    }

    /// Build the whole stack from configuration.
    ///
    /// Connects to Redis for the redis backend. In-process stores, including
    /// the memory fallback, get a sweeper that lives as long as the returned
    /// value.
    pub async fn from_config(config: &ProtectionConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new())).await
    }

    pub async fn from_config_with_clock(
        config: &ProtectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = config.build_resolver(Arc::new(InMemoryOverrideStore::new()), Arc::clone(&clock))?;

        let mut sweepers = Vec::new();
        let store: Arc<dyn ProtectionStore> = match config.store.backend {
            Backend::Memory => {
                let local = Arc::new(LocalStore::with_clock(Arc::clone(&clock)));
                sweepers.push(local.spawn_sweeper(config.store.sweep_interval()));
                local
            }
            Backend::Redis => Arc::new(
                DistributedStore::connect_with_clock(config.store.distributed(), Arc::clone(&clock)).await?,
            ),
        };

        let mut protection = Self::new(
            store,
            resolver,
            config.failure.clone(),
            config.store.key_builder(),
            clock,
        );
        if let Some(fallback) = protection.failure.fallback_store() {
            sweepers.push(fallback.spawn_sweeper(config.store.sweep_interval()));
        }
        protection.sweepers = sweepers;

        info!(
            backend = protection.failure.primary().backend(),
            prefix = protection.keys.prefix(),
            operations = protection.resolver.operations().len(),
            "Protection initialized"
        );
        Ok(protection)
    }

    /// Replace the identity and address resolvers.
    pub fn with_resolvers(mut self, resolvers: ResolverChain) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Replace the key expression evaluator.
    pub fn with_evaluator(mut self, evaluator: impl ExpressionEvaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure
    }

    pub fn engine(&self) -> &AlgorithmEngine {
        &self.engine
    }

    pub fn idempotency(&self) -> &IdempotencyManager {
        &self.idempotency
    }

    pub fn duplicates(&self) -> &DuplicateGuard {
        &self.duplicates
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Where store calls are currently routed.
    pub fn route(&self) -> StoreRoute {
        self.failure.mode()
    }

    fn evaluate_expression(
        &self,
        policy: &EffectivePolicy,
        ctx: &RequestContext,
        args: &[serde_json::Value],
    ) -> Result<Option<String>> {
        match &policy.key_expression {
            Some(expr) => {
                let vars = expression_vars(&policy.operation_id, ctx, &self.resolvers, args);
                self.evaluator.evaluate(expr, &vars).map(Some)
            }
            None => Ok(None),
        }
    }

    /// The rate limit key for a request under `policy`.
    pub fn rate_limit_key(&self, policy: &EffectivePolicy, ctx: &RequestContext) -> Result<ProtectionKey> {
        let fragment = if policy.dimension == Dimension::Custom {
            self.evaluate_expression(policy, ctx, &[])?
        } else {
            None
        };
        self.rate_keys.for_request(
            policy.dimension,
            &policy.operation_id,
            ctx,
            &self.resolvers,
            fragment.as_deref(),
        )
    }

    /// The idempotency key for a call under `policy`.
    pub fn idempotency_key(
        &self,
        policy: &EffectivePolicy,
        ctx: &RequestContext,
        args: &[serde_json::Value],
    ) -> Result<ProtectionKey> {
        let fragment = policy.idempotency_key.fragment(
            &policy.operation_id,
            ctx,
            &self.resolvers,
            self.evaluator.as_ref(),
            args,
        )?;
        self.idempotency_keys.for_request(
            Dimension::Custom,
            &policy.operation_id,
            ctx,
            &self.resolvers,
            Some(&fragment),
        )
    }

    /// The duplicate-window key for a submission under `policy`.
    ///
    /// The key expression, when set, identifies the submission; otherwise
    /// the digest of the arguments does.
    pub fn submission_key(
        &self,
        policy: &EffectivePolicy,
        ctx: &RequestContext,
        args: &[serde_json::Value],
    ) -> Result<ProtectionKey> {
        let fragment = match self.evaluate_expression(policy, ctx, args)? {
            Some(fragment) => fragment,
            None => hash_arguments(args),
        };
        self.duplicate_keys.for_request(
            policy.dimension,
            &policy.operation_id,
            ctx,
            &self.resolvers,
            Some(&fragment),
        )
    }

    /// Take one permit for `operation_id`.
    ///
    /// A rejection is [`ProtectionError::RateLimitExceeded`]; a disabled
    /// policy is never limited.
    pub async fn check_rate_limit(
        &self,
        operation_id: &str,
        ctx: &RequestContext,
    ) -> Result<RateLimitDecision> {
        let policy = self.resolver.resolve(operation_id).await?;
        if !policy.enabled {
            return Ok(RateLimitDecision::unlimited(self.clock.now_millis()));
        }

        let key = self.rate_limit_key(&policy, ctx)?;
        let decision = self.engine.acquire(&key, &policy.limit_spec()).await?;
        if decision.allowed {
            return Ok(decision);
        }

        warn!(
            key = %key,
            operation = operation_id,
            limit = decision.limit,
            retry_after_ms = decision.retry_after_ms,
            "Rate limit exceeded"
        );
        Err(ProtectionError::RateLimitExceeded {
            key: key.into_string(),
            message: policy.rate_limit_message,
            limit: decision.limit,
            reset_at_ms: decision.reset_at_ms,
            retry_after_ms: decision.retry_after_ms,
        })
    }

    /// Start an idempotent call.
    ///
    /// On [`Admission::Execute`] the caller runs the operation and then
    /// settles the returned key with [`complete`](Self::complete) or
    /// [`fail`](Self::fail).
    pub async fn begin_idempotent(
        &self,
        operation_id: &str,
        ctx: &RequestContext,
        args: &[serde_json::Value],
    ) -> Result<(ProtectionKey, Admission)> {
        let policy = self.resolver.resolve(operation_id).await?;
        let key = self.idempotency_key(&policy, ctx, args)?;
        if !policy.enabled {
            return Ok((key, Admission::Execute));
        }
        let admission = self.idempotency.acquire(&key, &policy.idempotency()).await?;
        Ok((key, admission))
    }

    /// Mark an idempotent call successful, caching `payload` for replay.
    pub async fn complete(&self, key: &ProtectionKey, payload: Option<String>) -> Result<bool> {
        Ok(self.idempotency.complete(key, payload).await?.is_some())
    }

    /// Mark an idempotent call failed.
    pub async fn fail(&self, key: &ProtectionKey, error: &str) -> Result<bool> {
        Ok(self.idempotency.fail(key, error).await?.is_some())
    }

    /// Run `operation` at most once for this operation id and arguments.
    pub async fn execute_idempotent<T, E, F, Fut>(
        &self,
        operation_id: &str,
        ctx: &RequestContext,
        args: &[serde_json::Value],
        operation: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<ProtectionError> + fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let policy = self.resolver.resolve(operation_id).await?;
        if !policy.enabled {
            return operation().await;
        }
        let key = self.idempotency_key(&policy, ctx, args)?;
        self.idempotency
            .execute(&key, &policy.idempotency(), operation)
            .await
    }

    /// The idempotency record under `key`, if live.
    pub async fn idempotency_record(&self, key: &ProtectionKey) -> Result<Option<IdempotencyRecord>> {
        self.idempotency.record(key).await
    }

    /// Forget an idempotency record so the next call executes.
    pub async fn invalidate(&self, key: &ProtectionKey) -> Result<bool> {
        self.idempotency.invalidate(key).await
    }

    /// Admit a submission unless the same one is inside its window.
    ///
    /// Returns the window key so a failed submission can be
    /// [`release`](Self::release)d.
    pub async fn submit(
        &self,
        operation_id: &str,
        ctx: &RequestContext,
        args: &[serde_json::Value],
    ) -> Result<ProtectionKey> {
        let policy = self.resolver.resolve(operation_id).await?;
        let key = self.submission_key(&policy, ctx, args)?;
        if policy.enabled {
            self.duplicates.check(&key, &policy.duplicate()).await?;
        }
        Ok(key)
    }

    /// Close a submission window early.
    pub async fn release(&self, key: &ProtectionKey) -> Result<bool> {
        self.duplicates.release(key).await
    }

    /// Entries under `pattern`, a key prefix with an optional trailing `*`.
    ///
    /// A pattern that does not start with the configured prefix is taken
    /// as relative to it.
    pub async fn count(&self, pattern: &str) -> Result<usize> {
        let full = if pattern.starts_with(self.keys.prefix()) {
            pattern.to_string()
        } else {
            format!("{}{}", self.keys.prefix_pattern(), pattern)
        };
        let prefix = full.as_str();
        Ok(self
            .failure
            .call(move |store| async move { store.count_by_prefix(prefix).await })
            .await
            .value()
            .unwrap_or(0))
    }
}
