//! Boundary of third-party and government systems.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use backbone_jobs::{JobArgs, JobError};

/// The business entity a submission concerns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionTarget {
    pub entity_type: String,
    pub entity_id: String,
}

impl SubmissionTarget {
    pub fn new(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl core::fmt::Display for SubmissionTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Job payload that submits one entity to an external system.
pub trait SubmissionRequest: JobArgs {
    fn target(&self) -> SubmissionTarget;

    /// Key the remote system can deduplicate on. Stable across retries.
    fn idempotency_key(&self) -> String {
        format!("{}:{}", Self::KIND, self.target())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// Timeout, connection failure, 5xx. Retried.
    #[error("{system} unavailable: {message}")]
    Unavailable { system: &'static str, message: String },

    /// Malformed or refused payload. Never retried.
    #[error("{system} rejected submission: {message}")]
    Rejected { system: &'static str, message: String },
}

impl From<ExternalError> for JobError {
    fn from(value: ExternalError) -> Self {
        match value {
            ExternalError::Unavailable { .. } => JobError::external(value.to_string()),
            ExternalError::Rejected { .. } => JobError::rejected(value.to_string()),
        }
    }
}

/// A system that accepts submissions of `R` and answers with a reference.
#[async_trait]
pub trait ExternalSystem<R: SubmissionRequest>: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reference of an earlier accepted submission under `key`, if the system
    /// can report it. Systems without a lookup return `Ok(None)`.
    async fn lookup(&self, key: &str) -> Result<Option<String>, ExternalError>;

    /// Submit and return the system's reference for the accepted request.
    async fn submit(&self, key: &str, request: &R) -> Result<String, ExternalError>;
}
