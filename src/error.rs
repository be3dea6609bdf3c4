//! Error types for Apiguard.

use thiserror::Error;

use crate::store::RecordStatus;

/// Main error type for Apiguard operations.
///
/// The three rejection variants are expected traffic shaping and carry enough
/// detail for a boundary layer to build a response; they are not faults.
#[derive(Error, Debug)]
pub enum ProtectionError {
    /// Invalid parameters or conflicting declarations
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The caller exhausted its permits for the current window
    #[error("Rate limit exceeded for {key}: {message}")]
    RateLimitExceeded {
        key: String,
        message: String,
        limit: u64,
        reset_at_ms: i64,
        retry_after_ms: u64,
    },

    /// The same submission arrived again inside its suppression window
    #[error("Duplicate submission for {key}: {message}")]
    DuplicateSubmission {
        key: String,
        message: String,
        retry_after_ms: u64,
    },

    /// An idempotent operation was already seen under this key
    #[error("Idempotency conflict for {key}: {reason}")]
    IdempotencyConflict {
        key: String,
        reason: ConflictReason,
        message: String,
        retry_after_ms: u64,
    },

    /// The custom key expression was rejected or failed to evaluate
    #[error("Expression error: {0}")]
    Expression(String),

    /// Backend failure that the failure policy chose not to absorb
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an idempotency check refused to let the caller execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The first execution is still running
    InProgress,
    /// Seen before and replay is disabled
    Duplicate,
    /// Completed, but no result payload was cached
    NoCachedResult,
    /// The previous execution failed and retry-on-failure is off
    PreviouslyFailed(String),
    /// The store was unavailable and the failure policy rejects
    StoreUnavailable,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::InProgress => write!(f, "request is still processing, retry later"),
            ConflictReason::Duplicate => write!(f, "duplicate request rejected"),
            ConflictReason::NoCachedResult => {
                write!(f, "request was processed but no cached result is available")
            }
            ConflictReason::PreviouslyFailed(detail) => {
                write!(f, "previous execution failed: {}", detail)
            }
            ConflictReason::StoreUnavailable => write!(f, "protection store unavailable"),
        }
    }
}

impl ConflictReason {
    /// The record status a conflict was raised for, if any.
    pub fn status(&self) -> Option<RecordStatus> {
        match self {
            ConflictReason::InProgress => Some(RecordStatus::Executing),
            ConflictReason::NoCachedResult => Some(RecordStatus::Success),
            ConflictReason::PreviouslyFailed(_) => Some(RecordStatus::Failed),
            ConflictReason::Duplicate | ConflictReason::StoreUnavailable => None,
        }
    }
}

/// Errors raised by a [`ProtectionStore`](crate::store::ProtectionStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis command or connection failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend did not answer inside the command timeout
    #[error("Store call timed out after {0} ms")]
    Timeout(u64),

    /// A stored value could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The backend is unavailable for another reason
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl ProtectionError {
    /// Whether this error is a traffic-shaping rejection rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProtectionError::RateLimitExceeded { .. }
                | ProtectionError::DuplicateSubmission { .. }
                | ProtectionError::IdempotencyConflict { .. }
        )
    }

    /// Retry hint in milliseconds for rejections.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProtectionError::RateLimitExceeded { retry_after_ms, .. }
            | ProtectionError::DuplicateSubmission { retry_after_ms, .. }
            | ProtectionError::IdempotencyConflict { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Result type alias for Apiguard operations.
pub type Result<T> = std::result::Result<T, ProtectionError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
