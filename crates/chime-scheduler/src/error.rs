//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Repository error.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The schedule cannot be honored (e.g. fire time in the past).
    #[error("invalid schedule for job {job_id}: {reason}")]
    InvalidSchedule { job_id: String, reason: String },
}

/// Errors raised by job repository implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Concurrent write detected on first insert.
    #[error("concurrent modification of job {0}")]
    ConcurrentModification(String),

    /// Stored record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors produced when invoking a job's recipient.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The recipient reported a failure.
    #[error("execution of job {job_id} failed: {message}")]
    Failed { job_id: String, message: String },

    /// The attempt exceeded the job's execution timeout.
    #[error("execution of job {job_id} timed out after {timeout_millis}ms")]
    TimedOut { job_id: String, timeout_millis: u64 },
}

impl ExecutionError {
    /// The id of the job the attempt belonged to.
    pub fn job_id(&self) -> &str {
        match self {
            ExecutionError::Failed { job_id, .. } => job_id,
            ExecutionError::TimedOut { job_id, .. } => job_id,
        }
    }
}
