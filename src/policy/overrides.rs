//! Storage for dynamic policy overrides.

use std::fmt::Debug;

use async_trait::async_trait;
use dashmap::DashMap;

use super::PolicyOverride;
use crate::error::StoreResult;

/// Where dynamic overrides live, keyed by operation id.
#[async_trait]
pub trait OverrideStore: Send + Sync + Debug {
    async fn load(&self, operation_id: &str) -> StoreResult<Option<PolicyOverride>>;

    async fn save(&self, operation_id: &str, policy: PolicyOverride) -> StoreResult<()>;

    /// Returns whether an override was removed.
    async fn remove(&self, operation_id: &str) -> StoreResult<bool>;

    /// Operation ids that currently have an override.
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Process-local override store.
#[derive(Debug, Default)]
pub struct InMemoryOverrideStore {
    overrides: DashMap<String, PolicyOverride>,
}

impl InMemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverrideStore for InMemoryOverrideStore {
    async fn load(&self, operation_id: &str) -> StoreResult<Option<PolicyOverride>> {
        Ok(self.overrides.get(operation_id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, operation_id: &str, policy: PolicyOverride) -> StoreResult<()> {
        self.overrides.insert(operation_id.to_string(), policy);
        Ok(())
    }

    async fn remove(&self, operation_id: &str) -> StoreResult<bool> {
        Ok(self.overrides.remove(operation_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.overrides.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
