//! Customs declarations for exported stock.

use serde::{Deserialize, Serialize};

use backbone_core::MovementId;
use backbone_jobs::JobArgs;

use crate::external::{SubmissionRequest, SubmissionTarget};

/// Declares an export movement to the customs authority.
///
/// The clearance reference the authority returns is the movement's marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomsDeclaration {
    pub movement_id: MovementId,
    pub sku: String,
    pub quantity: i64,
    pub destination: String,
}

impl JobArgs for CustomsDeclaration {
    const KIND: &'static str = "customs-declaration";
}

impl SubmissionRequest for CustomsDeclaration {
    fn target(&self) -> SubmissionTarget {
        SubmissionTarget::new("stock_movement", self.movement_id)
    }
}
