//! Error types for the job store, the queue and job handlers.

use backbone_core::{DomainError, JobId};
use thiserror::Error;

/// Persistence error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The caller's lease was taken over or the job already finished.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Row-level domain data failed to decode or violated a constraint.
    #[error("data error: {0}")]
    Data(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Database(value.to_string())
    }
}

/// Enqueue rejected before reaching the store, or failed in it.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// No handler is registered for the kind in this process.
    #[error("unknown job kind '{0}'")]
    UnknownKind(String),

    #[error("failed to serialize job args: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handler registration error. Surfaces at process start, never at dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler for job kind '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("job kind '{0}' has no registered handler")]
    UnknownKind(String),
}

/// Failure of a single handler invocation.
///
/// Decides what the dispatcher does with the job:
/// transient and non-permanent external failures are retried with backoff,
/// validation failures and permanent rejections are discarded at once.
#[derive(Debug, Error)]
pub enum JobError {
    /// Network, timeout or lock contention.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed or semantically invalid arguments.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A dependent third-party call failed.
    #[error("external system failed: {message}")]
    External { message: String, permanent: bool },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External {
            message: msg.into(),
            permanent: false,
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::External {
            message: msg.into(),
            permanent: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Transient(_) => true,
            JobError::Validation(_) => false,
            JobError::External { permanent, .. } => !permanent,
            JobError::Store(_) => true,
        }
    }
}

impl From<EnqueueError> for JobError {
    fn from(value: EnqueueError) -> Self {
        match value {
            // Only reachable through a wiring mistake; retrying will not help.
            EnqueueError::UnknownKind(kind) => JobError::Validation(format!("unknown job kind '{kind}'")),
            EnqueueError::Serialize(e) => JobError::Validation(e.to_string()),
            EnqueueError::Store(e) => JobError::Store(e),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => JobError::Transient(msg),
            other => JobError::Validation(other.to_string()),
        }
    }
}
