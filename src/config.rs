//! Configuration management for Apiguard.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::error::{ProtectionError, Result};
use crate::failure::FailureConfig;
use crate::key::{KeyBuilder, DEFAULT_PREFIX, DEFAULT_SEPARATOR};
use crate::policy::{ConfigResolver, ConflictStrategy, OverrideStore, PolicyDeclaration, PolicyDefaults};
use crate::store::DistributedStoreConfig;

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "APIGUARD";

/// Main configuration for Apiguard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Store failure handling
    #[serde(default)]
    pub failure: FailureConfig,

    /// System default policy
    #[serde(default)]
    pub defaults: PolicyDefaults,

    /// Reconciliation of differing GLOBAL declarations
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Staleness bound for cached overrides, in seconds
    #[serde(default = "default_override_cache_ttl")]
    pub override_cache_ttl_secs: u64,

    /// Static declarations by operation id
    #[serde(default)]
    pub policies: HashMap<String, Vec<PolicyDeclaration>>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            failure: FailureConfig::default(),
            defaults: PolicyDefaults::default(),
            conflict_strategy: ConflictStrategy::default(),
            override_cache_ttl_secs: default_override_cache_ttl(),
            policies: HashMap::new(),
        }
    }
}

fn default_override_cache_ttl() -> u64 {
    30
}

/// The `policies` section alone, read without key normalization.
#[derive(Debug, Default, Deserialize)]
struct PolicyTable {
    #[serde(default)]
    policies: HashMap<String, Vec<PolicyDeclaration>>,
}

/// Which store backs the protection mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process; state is per instance
    #[default]
    Memory,
    /// Shared through Redis
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for every key this instance writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_key_separator")]
    pub key_separator: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Retention beyond logical expiry on the distributed store
    #[serde(default = "default_ttl_buffer_secs")]
    pub ttl_buffer_secs: u64,

    /// Eviction interval of in-process stores
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            key_separator: default_key_separator(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ttl_buffer_secs: default_ttl_buffer_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_key_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_ttl_buffer_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    90
}

impl StoreConfig {
    pub fn distributed(&self) -> DistributedStoreConfig {
        DistributedStoreConfig {
            url: self.redis_url.clone(),
            ttl_buffer: Duration::from_secs(self.ttl_buffer_secs),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(self.key_prefix.clone(), self.key_separator.clone())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ProtectionConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading protection configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ProtectionError::Configuration(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer an optional YAML file under `APIGUARD__*` environment variables,
    /// e.g. `APIGUARD__STORE__BACKEND=redis`.
    ///
    /// The `config` crate lowercases map keys, so operation ids in
    /// `policies` are taken from the file as written. Policies cannot be
    /// set from the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let mut table = PolicyTable::default();
        if let Some(path) = path {
            info!(path = path, "Loading protection configuration");
            let contents = std::fs::read_to_string(path)?;
            table = serde_yaml::from_str(&contents).map_err(|e| {
                ProtectionError::Configuration(format!("Failed to parse policies: {}", e))
            })?;
            builder = builder.add_source(
                config::File::from_str(&contents, config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ProtectionError::Configuration(e.to_string()))?;
        config.policies = table.policies;
        Ok(config)
    }

    pub fn override_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.override_cache_ttl_secs)
    }

    /// A resolver holding every configured declaration.
    pub fn build_resolver(
        &self,
        overrides: Arc<dyn OverrideStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<ConfigResolver> {
        let resolver = ConfigResolver::new(self.defaults.clone(), self.conflict_strategy, overrides, clock)
            .with_cache_ttl(self.override_cache_ttl());

        let mut operations: Vec<&String> = self.policies.keys().collect();
        operations.sort();
        for operation_id in operations {
            for declaration in &self.policies[operation_id] {
                resolver.register_policy(operation_id, declaration.clone())?;
            }
        }
        resolver.validate()?;
        Ok(resolver)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let store = &self.store;
        if store.key_prefix.is_empty() || store.key_separator.is_empty() {
            return Err(ProtectionError::Configuration(
                "store.key_prefix and store.key_separator must not be empty".to_string(),
            ));
        }
        if store.backend == Backend::Redis && store.redis_url.is_empty() {
            return Err(ProtectionError::Configuration(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if store.command_timeout_ms == 0 || store.connect_timeout_ms == 0 {
            return Err(ProtectionError::Configuration(
                "store timeouts must be positive".to_string(),
            ));
        }
        if store.sweep_interval_secs == 0 {
            return Err(ProtectionError::Configuration(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.failure.max_errors == 0 {
            return Err(ProtectionError::Configuration(
                "failure.max_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
