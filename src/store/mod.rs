//! Atomic key-value protection store.
//!
//! All three protection mechanisms run on the [`ProtectionStore`] trait. The
//! two backends must be indistinguishable to callers:
//!
//! - concurrent `get_or_create` calls on a fresh key yield exactly one
//!   `created == true`;
//! - record status only moves forward (see [`RecordUpdate`]);
//! - a record past its logical expiry is never returned as live.

mod distributed;
mod local;
mod scripts;

pub use distributed::{DistributedStore, DistributedStoreConfig};
pub use local::{LocalStore, SweeperHandle};

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::{deadline_after, millis_of};
use crate::error::StoreResult;
use crate::key::ProtectionKey;
use crate::ratelimit::{RateLimitDecision, WindowRequest};

/// Execution status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Executing,
    Success,
    Failed,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordStatus::Executing => "EXECUTING",
            RecordStatus::Success => "SUCCESS",
            RecordStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A stored protection record.
///
/// Duplicate-guard windows leave `status` empty; idempotency records always
/// carry one. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRecord {
    #[serde(default)]
    pub status: Option<RecordStatus>,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub access_count: u64,
}

impl ProtectionRecord {
    /// A record created at `now_ms` living for `ttl`.
    pub fn new(status: Option<RecordStatus>, now_ms: i64, ttl: Duration) -> Self {
        Self {
            status,
            created_at: now_ms,
            expires_at: deadline_after(now_ms, millis_of(ttl)),
            payload: None,
            error: None,
            access_count: 0,
        }
    }

    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }

    /// Milliseconds until expiry, zero if already expired.
    pub fn remaining_ms(&self, now_ms: i64) -> u64 {
        (self.expires_at - now_ms).max(0) as u64
    }
}

/// A data-described record mutation.
///
/// Updates are plain data so the distributed store can run them inside a
/// server-side script. Each variant applies only from one source status,
/// which keeps transitions monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RecordUpdate {
    /// EXECUTING -> SUCCESS, optionally caching a result payload
    Complete { payload: Option<String> },
    /// EXECUTING -> FAILED
    Fail { error: String },
    /// FAILED -> EXECUTING with a fresh expiry, for retry-on-failure
    Restart { expires_at: i64 },
}

impl RecordUpdate {
    /// Apply to a live record. Returns whether the record changed.
    pub fn apply(&self, record: &mut ProtectionRecord, now_ms: i64) -> bool {
        match (self, record.status) {
            (RecordUpdate::Complete { payload }, Some(RecordStatus::Executing)) => {
                record.status = Some(RecordStatus::Success);
                record.payload = payload.clone();
                record.error = None;
                true
            }
            (RecordUpdate::Fail { error }, Some(RecordStatus::Executing)) => {
                record.status = Some(RecordStatus::Failed);
                record.error = Some(error.clone());
                true
            }
            (RecordUpdate::Restart { expires_at }, Some(RecordStatus::Failed)) => {
                record.status = Some(RecordStatus::Executing);
                record.created_at = now_ms;
                record.expires_at = *expires_at;
                record.payload = None;
                record.error = None;
                true
            }
            _ => false,
        }
    }
}

/// Result of [`ProtectionStore::compare_and_update`] on a live record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Updated {
    /// The record after the call
    pub record: ProtectionRecord,
    /// Whether this call changed it
    pub applied: bool,
}

/// Atomic operations shared by the protection mechanisms.
#[async_trait]
pub trait ProtectionStore: Send + Sync + Debug {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Install `candidate` unless a live record exists.
    ///
    /// Returns the live record and whether this call created it. A hit
    /// increments the existing record's access counter. `ttl` is the logical
    /// lifetime; backends may retain the entry slightly longer.
    async fn get_or_create(
        &self,
        key: &ProtectionKey,
        candidate: ProtectionRecord,
        ttl: Duration,
    ) -> StoreResult<(ProtectionRecord, bool)>;

    /// Apply `update` to the live record under `key`.
    ///
    /// Returns `None` when there is no live record.
    async fn compare_and_update(
        &self,
        key: &ProtectionKey,
        update: &RecordUpdate,
    ) -> StoreResult<Option<Updated>>;

    /// The live record under `key`, if any.
    async fn get(&self, key: &ProtectionKey) -> StoreResult<Option<ProtectionRecord>>;

    /// Remove `key`. Returns whether anything was removed.
    async fn delete(&self, key: &ProtectionKey) -> StoreResult<bool>;

    /// Whether a live entry exists under `key`.
    async fn exists(&self, key: &ProtectionKey) -> StoreResult<bool>;

    /// Number of entries whose key starts with `prefix` (a trailing `*` is
    /// accepted and ignored).
    async fn count_by_prefix(&self, prefix: &str) -> StoreResult<usize>;

    /// Run one rate limit check atomically against the state under `key`.
    async fn evaluate_window(
        &self,
        key: &ProtectionKey,
        request: &WindowRequest,
    ) -> StoreResult<RateLimitDecision>;

    /// Cheap liveness probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Normalize a count pattern to a bare prefix.
pub(crate) fn strip_pattern(pattern: &str) -> &str {
    pattern.strip_suffix('*').unwrap_or(pattern)
}
