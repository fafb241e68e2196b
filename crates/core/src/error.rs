//! Batch error model.

use thiserror::Error;

/// Result type used across the batch engine.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors surfaced synchronously to whoever launches or queries a job.
///
/// Failures that happen *while* a job runs never show up here; they are
/// recorded on the execution (status + exit description) and observed by
/// polling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Missing or malformed job parameters. Raised before anything is persisted.
    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    /// A job instance with the same identity already exists.
    #[error("job instance already exists: {job_name} [{identity}]")]
    DuplicateInstance { job_name: String, identity: String },

    /// The instance already has a COMPLETED execution.
    #[error("job instance already complete: {job_name} [{identity}]")]
    InstanceAlreadyComplete { job_name: String, identity: String },

    /// The instance has an execution that is still in flight.
    #[error("job execution already running: {0}")]
    ExecutionAlreadyRunning(u64),

    /// A restart was attempted with incompatible parameters or step layout.
    #[error("restart rejected: {0}")]
    RestartInvalid(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted in a status that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The execution store failed.
    #[error("store error: {0}")]
    Store(String),
}

impl BatchError {
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn restart_invalid(msg: impl Into<String>) -> Self {
        Self::RestartInvalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
