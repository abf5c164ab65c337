//! HTTP clients for the systems the worker calls out to.
//!
//! Every client carries a bounded request timeout. Timeouts, connection
//! failures, 5xx and 429 are reported as unavailable (retried); any other
//! error status is a rejection (not retried).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use backbone_saga::offboarding::{AccessControl, AssetRegistry, CollaboratorError, Telephony, UserId};
use backbone_submission::{CustomsDeclaration, ExternalError, ExternalSystem};

fn client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

fn base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Map a collaborator response. 409 means the effect is already in place.
async fn collaborator_outcome(system: &'static str, resp: Response) -> Result<Response, CollaboratorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::CONFLICT {
        return Err(CollaboratorError::AlreadyDone { system });
    }

    let body = resp.text().await.unwrap_or_default();
    let message = format!("{status}: {body}");
    if is_transient(status) {
        Err(CollaboratorError::Unavailable { system, message })
    } else {
        Err(CollaboratorError::Rejected { system, message })
    }
}

fn unreachable(system: &'static str, err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Unavailable {
        system,
        message: err.to_string(),
    }
}

/// `POST {base}/users/{id}/revocations`
pub struct HttpAccessControl {
    client: Client,
    base_url: String,
}

impl HttpAccessControl {
    const SYSTEM: &'static str = "access-control";

    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base(base_url),
        })
    }
}

#[async_trait]
impl AccessControl for HttpAccessControl {
    async fn revoke_all(&self, user: UserId) -> Result<(), CollaboratorError> {
        let url = format!("{}/users/{}/revocations", self.base_url, user);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| unreachable(Self::SYSTEM, e))?;
        collaborator_outcome(Self::SYSTEM, resp).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ReclaimResponse {
    flagged: u32,
}

/// `POST {base}/users/{id}/reclaims`, answering `{"flagged": n}`.
pub struct HttpAssetRegistry {
    client: Client,
    base_url: String,
}

impl HttpAssetRegistry {
    const SYSTEM: &'static str = "asset-registry";

    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base(base_url),
        })
    }
}

#[async_trait]
impl AssetRegistry for HttpAssetRegistry {
    async fn reclaim_assets(&self, user: UserId) -> Result<u32, CollaboratorError> {
        let url = format!("{}/users/{}/reclaims", self.base_url, user);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| unreachable(Self::SYSTEM, e))?;
        let resp = collaborator_outcome(Self::SYSTEM, resp).await?;
        let body: ReclaimResponse = resp.json().await.map_err(|e| CollaboratorError::Unavailable {
            system: Self::SYSTEM,
            message: format!("unreadable response: {e}"),
        })?;
        Ok(body.flagged)
    }
}

/// `PUT {base}/extensions/{id}/forwarding`
pub struct HttpTelephony {
    client: Client,
    base_url: String,
}

impl HttpTelephony {
    const SYSTEM: &'static str = "telephony";

    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base(base_url),
        })
    }
}

#[async_trait]
impl Telephony for HttpTelephony {
    async fn forward_calls(&self, user: UserId) -> Result<(), CollaboratorError> {
        let url = format!("{}/extensions/{}/forwarding", self.base_url, user);
        let resp = self
            .client
            .put(&url)
            .json(&json!({ "target": "manager" }))
            .send()
            .await
            .map_err(|e| unreachable(Self::SYSTEM, e))?;
        collaborator_outcome(Self::SYSTEM, resp).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct DeclarationReceipt {
    reference: String,
}

/// Customs authority gateway.
///
/// Submissions carry an `Idempotency-Key` header; earlier submissions can be
/// looked up by that key with `GET {base}/declarations/{key}`.
pub struct HttpCustomsGateway {
    client: Client,
    base_url: String,
}

impl HttpCustomsGateway {
    const SYSTEM: &'static str = "customs";

    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base(base_url),
        })
    }

    async fn receipt(resp: Response) -> Result<String, ExternalError> {
        let status = resp.status();
        if status.is_success() {
            let receipt: DeclarationReceipt = resp.json().await.map_err(|e| ExternalError::Unavailable {
                system: Self::SYSTEM,
                message: format!("unreadable receipt: {e}"),
            })?;
            return Ok(receipt.reference);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = format!("{status}: {body}");
        if is_transient(status) {
            Err(ExternalError::Unavailable { system: Self::SYSTEM, message })
        } else {
            Err(ExternalError::Rejected { system: Self::SYSTEM, message })
        }
    }

    fn unavailable(err: reqwest::Error) -> ExternalError {
        ExternalError::Unavailable {
            system: Self::SYSTEM,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ExternalSystem<CustomsDeclaration> for HttpCustomsGateway {
    fn name(&self) -> &'static str {
        Self::SYSTEM
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>, ExternalError> {
        let url = format!("{}/declarations/{}", self.base_url, key);
        let resp = self.client.get(&url).send().await.map_err(Self::unavailable)?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(key, "no earlier declaration under key");
            return Ok(None);
        }
        Self::receipt(resp).await.map(Some)
    }

    async fn submit(&self, key: &str, request: &CustomsDeclaration) -> Result<String, ExternalError> {
        let url = format!("{}/declarations", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", key)
            .json(request)
            .send()
            .await
            .map_err(Self::unavailable)?;
        Self::receipt(resp).await
    }
}
