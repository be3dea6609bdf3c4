//! Execute-once control.
//!
//! Per key: absent -> EXECUTING -> SUCCESS | FAILED. The first caller to
//! [`IdempotencyManager::begin`] a fresh key creates the EXECUTING record and
//! runs the operation; everyone else observes that record and branches on its
//! status through [`IdempotencyManager::acquire`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{deadline_after, millis_of, Clock};
use crate::error::{ConflictReason, ProtectionError, Result, StoreError};
use crate::failure::{FailurePolicy, Guarded};
use crate::key::ProtectionKey;
use crate::store::{ProtectionRecord, RecordStatus, RecordUpdate, Updated};

/// How callers that find an existing record are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    /// Lifetime of a record from its (re)start
    pub timeout: Duration,
    /// Return the first result instead of rejecting repeats
    pub replay_result: bool,
    /// Store the result payload for replay
    pub cache_result: bool,
    /// Let a repeat re-execute after a failure
    pub retry_on_failure: bool,
    pub message: String,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            replay_result: true,
            cache_result: true,
            retry_on_failure: true,
            message: "Duplicate request".to_string(),
        }
    }
}

/// What the caller should do with the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Run the operation, then `complete` or `fail` the key
    Execute,
    /// Return this previously cached payload
    Replay(String),
}

/// Result of [`IdempotencyManager::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    pub record: ProtectionRecord,
    /// Whether this call created the record
    pub created: bool,
}

/// Read-only view of an idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotencyRecord {
    pub status: RecordStatus,
    pub first_seen_ms: i64,
    pub expires_at_ms: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub access_count: u64,
}

impl IdempotencyRecord {
    /// `None` for records without a status, which belong to another mechanism.
    pub fn from_record(record: ProtectionRecord) -> Option<Self> {
        Some(Self {
            status: record.status?,
            first_seen_ms: record.created_at,
            expires_at_ms: record.expires_at,
            result: record.payload,
            error: record.error,
            access_count: record.access_count,
        })
    }
}

/// Runs the idempotency state machine through the failure policy.
#[derive(Debug, Clone)]
pub struct IdempotencyManager {
    failure: Arc<FailurePolicy>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyManager {
    pub fn new(failure: Arc<FailurePolicy>, clock: Arc<dyn Clock>) -> Self {
        Self { failure, clock }
    }

    /// Create an EXECUTING record unless a live one exists.
    ///
    /// When the store is unreachable and the failure policy allows, the call
    /// behaves as if it created the record, so the operation runs unprotected.
    pub async fn begin(&self, key: &ProtectionKey, timeout: Duration) -> Result<Begin> {
        let candidate =
            ProtectionRecord::new(Some(RecordStatus::Executing), self.clock.now_millis(), timeout);
        let offered = candidate.clone();

        match self
            .failure
            .call(move |store| async move { store.get_or_create(key, offered, timeout).await })
            .await
        {
            Guarded::Value((record, created)) => {
                debug!(key = %key, created = created, status = ?record.status, "Idempotency begin");
                Ok(Begin { record, created })
            }
            Guarded::Allow => Ok(Begin {
                record: candidate,
                created: true,
            }),
            Guarded::Reject => Err(unavailable(key)),
        }
    }

    /// EXECUTING -> SUCCESS, caching `payload` when given.
    ///
    /// Returns the record after the call, or `None` if it expired or the
    /// store could not be reached.
    pub async fn complete(
        &self,
        key: &ProtectionKey,
        payload: Option<String>,
    ) -> Result<Option<ProtectionRecord>> {
        self.transition(key, RecordUpdate::Complete { payload }).await
    }

    /// EXECUTING -> FAILED.
    pub async fn fail(&self, key: &ProtectionKey, error: &str) -> Result<Option<ProtectionRecord>> {
        self.transition(
            key,
            RecordUpdate::Fail {
                error: error.to_string(),
            },
        )
        .await
    }

    async fn transition(
        &self,
        key: &ProtectionKey,
        update: RecordUpdate,
    ) -> Result<Option<ProtectionRecord>> {
        let change = &update;
        match self
            .failure
            .call(move |store| async move { store.compare_and_update(key, change).await })
            .await
        {
            Guarded::Value(Some(Updated { record, applied })) => {
                if !applied {
                    debug!(key = %key, status = ?record.status, "Idempotency transition skipped");
                }
                Ok(Some(record))
            }
            Guarded::Value(None) => {
                warn!(key = %key, "Idempotency record expired before it was settled");
                Ok(None)
            }
            Guarded::Allow | Guarded::Reject => Ok(None),
        }
    }

    /// Decide what to do with a request under `key`.
    pub async fn acquire(&self, key: &ProtectionKey, policy: &IdempotencyPolicy) -> Result<Admission> {
        let Begin { record, created } = self.begin(key, policy.timeout).await?;
        if created {
            return Ok(Admission::Execute);
        }

        match (record.status, &record.payload) {
            (Some(RecordStatus::Success), Some(payload)) if policy.replay_result => {
                debug!(key = %key, "Replaying cached result");
                Ok(Admission::Replay(payload.clone()))
            }
            (Some(RecordStatus::Failed), _) if policy.retry_on_failure => {
                self.restart(key, policy).await
            }
            _ => Err(self.conflict(key, &record, policy)),
        }
    }

    async fn restart(&self, key: &ProtectionKey, policy: &IdempotencyPolicy) -> Result<Admission> {
        let update = RecordUpdate::Restart {
            expires_at: deadline_after(self.clock.now_millis(), millis_of(policy.timeout)),
        };
        let change = &update;
        match self
            .failure
            .call(move |store| async move { store.compare_and_update(key, change).await })
            .await
        {
            Guarded::Value(Some(Updated { applied: true, .. })) => {
                debug!(key = %key, "Re-executing after previous failure");
                Ok(Admission::Execute)
            }
            // Another caller restarted it first.
            Guarded::Value(Some(Updated { record, .. })) => Err(self.conflict(key, &record, policy)),
            // Expired in between; start over once.
            Guarded::Value(None) => {
                let Begin { record, created } = self.begin(key, policy.timeout).await?;
                if created {
                    Ok(Admission::Execute)
                } else {
                    Err(self.conflict(key, &record, policy))
                }
            }
            Guarded::Allow => Ok(Admission::Execute),
            Guarded::Reject => Err(unavailable(key)),
        }
    }

    fn conflict(
        &self,
        key: &ProtectionKey,
        record: &ProtectionRecord,
        policy: &IdempotencyPolicy,
    ) -> ProtectionError {
        let reason = match record.status {
            Some(RecordStatus::Success) if policy.replay_result => ConflictReason::NoCachedResult,
            Some(RecordStatus::Failed) => ConflictReason::PreviouslyFailed(
                record
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            Some(RecordStatus::Executing) | None if policy.replay_result => ConflictReason::InProgress,
            _ => ConflictReason::Duplicate,
        };
        let retry_after_ms = match reason {
            ConflictReason::NoCachedResult => 0,
            _ => record.remaining_ms(self.clock.now_millis()),
        };

        warn!(key = %key, reason = %reason, retry_after_ms = retry_after_ms, "Idempotency conflict");
        ProtectionError::IdempotencyConflict {
            key: key.to_string(),
            reason,
            message: policy.message.clone(),
            retry_after_ms,
        }
    }

    /// Run `operation` at most once per key.
    ///
    /// A successful value is serialized as JSON for replay when the policy
    /// caches results; later callers get it deserialized instead of running
    /// `operation`. An error marks the key FAILED and is returned as is.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &ProtectionKey,
        policy: &IdempotencyPolicy,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<ProtectionError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.acquire(key, policy).await? {
            Admission::Replay(payload) => serde_json::from_str(&payload)
                .map_err(|e| E::from(ProtectionError::Store(StoreError::Codec(e)))),
            Admission::Execute => match operation().await {
                Ok(value) => {
                    let payload = if policy.cache_result {
                        match serde_json::to_string(&value) {
                            Ok(payload) => Some(payload),
                            Err(e) => {
                                warn!(key = %key, error = %e, "Result not cacheable");
                                None
                            }
                        }
                    } else {
                        None
                    };
                    self.complete(key, payload).await?;
                    Ok(value)
                }
                Err(e) => {
                    self.fail(key, &e.to_string()).await?;
                    Err(e)
                }
            },
        }
    }

    /// Drop the record so the next request executes afresh.
    pub async fn invalidate(&self, key: &ProtectionKey) -> Result<bool> {
        Ok(self
            .failure
            .call(move |store| async move { store.delete(key).await })
            .await
            .value()
            .unwrap_or(false))
    }

    /// Inspect the live record under `key`.
    pub async fn record(&self, key: &ProtectionKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .failure
            .call(move |store| async move { store.get(key).await })
            .await
            .value()
            .flatten()
            .and_then(IdempotencyRecord::from_record))
    }
}

fn unavailable(key: &ProtectionKey) -> ProtectionError {
    ProtectionError::IdempotencyConflict {
        key: key.to_string(),
        reason: ConflictReason::StoreUnavailable,
        message: "protection store unavailable".to_string(),
        retry_after_ms: 0,
    }
}
