//! Job model error type.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used across the job model.
pub type JobResult<T> = Result<T, JobError>;

/// Job-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// transitions, conflicts). Storage and process concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A value failed validation (malformed id, command, record or config value).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The state machine does not allow this edge.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    Conflict(JobId),

    /// No job with this id (or not in the required state).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A job could not be turned into its stored record.
    #[error("failed to encode job record: {0}")]
    Encode(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
