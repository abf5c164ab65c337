//! Offboarding saga.
//!
//! `offboard {"userId": n}` marks the person as offboarding and fans out three
//! independent steps, each with its own retries and audit trail:
//! `credential-revocation`, `asset-cleanup` and `call-forwarding`.

mod collaborators;
mod steps;
mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use backbone_jobs::{JobArgs, JobError, NewJob};

use crate::coordinator::{Saga, SagaStart};

pub use collaborators::{AccessControl, AssetRegistry, CollaboratorError, Telephony};
pub use steps::{CleanupAssetsHandler, ForwardCallsHandler, RevokeCredentialsHandler};
pub use store::{OffboardingCase, OffboardingStore, OffboardingTables, ensure_schema};

/// Person identifier as used by the HR side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offboard {
    pub user_id: UserId,
}

impl JobArgs for Offboard {
    const KIND: &'static str = "offboard";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeCredentials {
    pub user_id: UserId,
}

impl JobArgs for RevokeCredentials {
    const KIND: &'static str = "credential-revocation";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupAssets {
    pub user_id: UserId,
}

impl JobArgs for CleanupAssets {
    const KIND: &'static str = "asset-cleanup";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardCalls {
    pub user_id: UserId,
}

impl JobArgs for ForwardCalls {
    const KIND: &'static str = "call-forwarding";
}

/// The offboarding saga definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffboardingSaga;

#[async_trait]
impl<B: OffboardingStore> Saga<B> for OffboardingSaga {
    type Args = Offboard;

    fn name(&self) -> &'static str {
        "offboarding"
    }

    async fn begin(&self, store: &B, tx: &mut B::Tx, args: &Offboard) -> Result<SagaStart, JobError> {
        if args.user_id.0 <= 0 {
            return Err(JobError::validation(format!("invalid userId {}", args.user_id)));
        }
        if store.start_offboarding(tx, args.user_id).await? {
            Ok(SagaStart::Started)
        } else {
            Ok(SagaStart::AlreadyStarted)
        }
    }

    fn steps(&self, args: &Offboard) -> Result<Vec<NewJob>, JobError> {
        let user_id = args.user_id;
        let steps = [
            NewJob::typed(&RevokeCredentials { user_id }),
            NewJob::typed(&CleanupAssets { user_id }),
            NewJob::typed(&ForwardCalls { user_id }),
        ];
        steps
            .into_iter()
            .map(|s| s.map_err(|e| JobError::validation(e.to_string())))
            .collect()
    }
}
