//! Error types for dispatch operations.

use thiserror::Error;

use crate::core::job::{JobId, JobStatus};

/// Errors surfaced by the counter and job store ports.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store returned a record this crate cannot interpret.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors produced by the scheduler's public surface.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Submission failed validation; never retried.
    #[error("invalid submission: {0}")]
    Validation(String),
    /// Queue plus in-flight jobs reached the configured capacity. Nothing
    /// was persisted.
    #[error("queue full: {queued} of {capacity} slots in use")]
    QueueFull {
        /// Jobs currently queued or processing.
        queued: usize,
        /// Configured queue capacity.
        capacity: usize,
    },
    /// No executor is registered for the submitted job type.
    #[error("no executor registered for job type `{0}`")]
    UnknownJobType(String),
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// The job already reached a terminal status and cannot change.
    #[error("job {id} is already terminal ({status})")]
    AlreadyTerminal {
        /// Job identifier.
        id: JobId,
        /// The terminal status the job holds.
        status: JobStatus,
    },
    /// A store operation failed in a context that cannot degrade.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a job executor. The variant decides retry
/// eligibility: `Transient` and `Timeout` re-enter the backoff cycle,
/// `Permanent` goes straight to `Failed`.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Transport faults, upstream 5xx-equivalents, and other retryable
    /// conditions.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The job can never succeed as submitted.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The per-type execution deadline elapsed.
    #[error("execution timed out")]
    Timeout,
}

impl ExecutionError {
    /// Whether this failure is eligible for the retry/backoff cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
