//! The primary path an edge operation is normally applied on.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::buffer::EdgeOperation;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrimaryError {
    /// Network failure, timeout or 5xx. The operation may be buffered.
    #[error("primary unreachable: {0}")]
    Unreachable(String),

    /// The primary refused the operation and will keep refusing it.
    #[error("primary rejected operation: {0}")]
    Rejected(String),
}

/// Applies operations on the primary store.
///
/// Replays use the same implementation as live recording.
#[async_trait]
pub trait Primary<T: EdgeOperation>: Send + Sync {
    async fn apply(&self, op: &T) -> Result<(), PrimaryError>;
}

/// Where an operation family is posted on the primary API.
pub trait PrimaryEndpoint {
    const PATH: &'static str;
}

/// JSON-over-HTTP primary: `POST {base_url}/{T::PATH}`.
pub struct HttpPrimary<T> {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    _family: PhantomData<fn() -> T>,
}

impl<T> HttpPrimary<T> {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PrimaryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PrimaryError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            _family: PhantomData,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl<T: EdgeOperation + PrimaryEndpoint> Primary<T> for HttpPrimary<T> {
    async fn apply(&self, op: &T) -> Result<(), PrimaryError> {
        let url = format!("{}/{}", self.base_url, T::PATH);
        let mut req = self.client.post(&url).json(op);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| PrimaryError::Unreachable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(PrimaryError::Unreachable(format!("{status}: {body}")))
        } else {
            Err(PrimaryError::Rejected(format!("{status}: {body}")))
        }
    }
}
