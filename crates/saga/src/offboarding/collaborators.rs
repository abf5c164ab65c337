//! Boundaries of the systems an offboarding touches.
//!
//! Implementations live with the process wiring (HTTP clients with bounded
//! timeouts); tests use scripted doubles.

use async_trait::async_trait;
use thiserror::Error;

use backbone_jobs::JobError;

use super::UserId;

/// Failure reported by a collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Timeout, connection failure, 5xx.
    #[error("{system} unavailable: {message}")]
    Unavailable { system: &'static str, message: String },

    /// The collaborator refused the request and will keep refusing it.
    #[error("{system} rejected request: {message}")]
    Rejected { system: &'static str, message: String },

    /// Nothing left to do for this user (e.g. already revoked).
    #[error("{system}: nothing to do for user")]
    AlreadyDone { system: &'static str },
}

impl From<CollaboratorError> for JobError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::Unavailable { .. } => JobError::external(value.to_string()),
            CollaboratorError::Rejected { .. } => JobError::rejected(value.to_string()),
            // Callers treat AlreadyDone as success; reaching here is a no-op failure.
            CollaboratorError::AlreadyDone { .. } => JobError::validation(value.to_string()),
        }
    }
}

/// Identity and access management.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Revoke every credential, session and key of the user.
    async fn revoke_all(&self, user: UserId) -> Result<(), CollaboratorError>;
}

/// Hardware and license inventory.
#[async_trait]
pub trait AssetRegistry: Send + Sync {
    /// Flag the user's assets for return; returns how many were flagged.
    async fn reclaim_assets(&self, user: UserId) -> Result<u32, CollaboratorError>;
}

/// Phone system.
#[async_trait]
pub trait Telephony: Send + Sync {
    /// Forward the user's extension to their manager or the switchboard.
    async fn forward_calls(&self, user: UserId) -> Result<(), CollaboratorError>;
}
