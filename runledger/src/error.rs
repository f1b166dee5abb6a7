//! Error types for ledger operations.

use crate::job::{JobId, JobStatus};

/// Convenience alias used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while reading or writing the ledger.
///
/// A missing job is never an error: lookups return `Option` and writes
/// return `false`.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A job with this id already exists.
    #[error("job {0} already exists")]
    Conflict(JobId),

    /// The row moved past the caller's version token.
    #[error("job {job_id} was modified concurrently (expected version {expected})")]
    VersionConflict {
        /// Job whose update was rejected.
        job_id: JobId,
        /// Version token the caller read.
        expected: i64,
    },

    /// Lock, deadlock, serialization or timeout failure. Retried internally.
    #[error("write contention: {0}")]
    Contention(String),

    /// The requested status change is not in the transition table.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being updated.
        job_id: JobId,
        /// Status currently stored.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A stored row could not be decoded.
    #[error("schema error: {0}")]
    Schema(String),

    /// Unclassified database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Side-file I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of parameter maps failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Whether the retry loop should attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Conflict(_) => "conflict",
            LedgerError::VersionConflict { .. } => "version_conflict",
            LedgerError::Contention(_) => "contention",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::Validation(_) => "validation",
            LedgerError::Schema(_) => "schema",
            LedgerError::Database(_) => "database",
            LedgerError::Io(_) => "io",
            LedgerError::Serialization(_) => "serialization",
        }
    }
}
