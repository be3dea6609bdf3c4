//! Duplicate-submission suppression.
//!
//! The first submission under a key opens a window of `interval`; every
//! submission before it closes is a duplicate. There is no status machine,
//! only create and expire.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{millis_of, Clock};
use crate::error::{ProtectionError, Result};
use crate::failure::{FailurePolicy, Guarded};
use crate::key::ProtectionKey;
use crate::store::ProtectionRecord;

/// Suppression window settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePolicy {
    pub interval: Duration,
    pub message: String,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            message: "Duplicate submission, please wait".to_string(),
        }
    }
}

/// The open window a duplicate ran into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateRecord {
    pub first_submit_ms: i64,
    pub expires_at_ms: i64,
    /// Submissions seen after the first
    pub access_count: u64,
}

impl From<ProtectionRecord> for DuplicateRecord {
    fn from(record: ProtectionRecord) -> Self {
        Self {
            first_submit_ms: record.created_at,
            expires_at_ms: record.expires_at,
            access_count: record.access_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateGuard {
    failure: Arc<FailurePolicy>,
    clock: Arc<dyn Clock>,
}

impl DuplicateGuard {
    pub fn new(failure: Arc<FailurePolicy>, clock: Arc<dyn Clock>) -> Self {
        Self { failure, clock }
    }

    /// Open a window under `key`, or report the one already open.
    ///
    /// Returns `None` for a first submission and the existing record for a
    /// duplicate.
    pub async fn check_and_record(
        &self,
        key: &ProtectionKey,
        interval: Duration,
    ) -> Result<Option<DuplicateRecord>> {
        let candidate = ProtectionRecord::new(None, self.clock.now_millis(), interval);
        match self
            .failure
            .call(move |store| async move { store.get_or_create(key, candidate, interval).await })
            .await
        {
            Guarded::Value((_, true)) => Ok(None),
            Guarded::Value((record, false)) => Ok(Some(record.into())),
            Guarded::Allow => Ok(None),
            Guarded::Reject => Err(ProtectionError::DuplicateSubmission {
                key: key.to_string(),
                message: "protection store unavailable".to_string(),
                retry_after_ms: 0,
            }),
        }
    }

    /// Like [`check_and_record`](Self::check_and_record), but a duplicate is
    /// a [`ProtectionError::DuplicateSubmission`].
    pub async fn check(&self, key: &ProtectionKey, policy: &DuplicatePolicy) -> Result<()> {
        match self.check_and_record(key, policy.interval).await? {
            None => {
                debug!(key = %key, interval_ms = millis_of(policy.interval), "Submission window opened");
                Ok(())
            }
            Some(existing) => {
                let retry_after_ms = (existing.expires_at_ms - self.clock.now_millis()).max(0) as u64;
                warn!(
                    key = %key,
                    attempts = existing.access_count + 1,
                    retry_after_ms = retry_after_ms,
                    "Duplicate submission"
                );
                Err(ProtectionError::DuplicateSubmission {
                    key: key.to_string(),
                    message: policy.message.clone(),
                    retry_after_ms,
                })
            }
        }
    }

    /// Close the window early, e.g. after the submission failed.
    pub async fn release(&self, key: &ProtectionKey) -> Result<bool> {
        Ok(self
            .failure
            .call(move |store| async move { store.delete(key).await })
            .await
            .value()
            .unwrap_or(false))
    }
}
