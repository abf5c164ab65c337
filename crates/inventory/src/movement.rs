//! Stock movements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use backbone_cascade::{CascadeError, Mutation, UnitOfWork};
use backbone_core::{DomainError, MovementId};
use backbone_jobs::StoreError;

use crate::store::InventoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Receipt,
    Issue,
    /// Outbound across a border; declared to customs.
    Export,
    /// Stocktake correction, either sign.
    Adjustment,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Receipt => "receipt",
            MovementKind::Issue => "issue",
            MovementKind::Export => "export",
            MovementKind::Adjustment => "adjustment",
        }
    }
}

impl core::str::FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(MovementKind::Receipt),
            "issue" => Ok(MovementKind::Issue),
            "export" => Ok(MovementKind::Export),
            "adjustment" => Ok(MovementKind::Adjustment),
            other => Err(format!("unknown movement kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub sku: String,
    pub kind: MovementKind,
    /// Units moved. Positive except for adjustments, which carry their sign.
    pub quantity: i64,
    pub destination: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    /// Entity type under which movements are reported to cascades.
    pub const ENTITY_TYPE: &'static str = "stock_movement";

    pub fn new(sku: impl Into<String>, kind: MovementKind, quantity: i64) -> Self {
        Self {
            id: MovementId::new(),
            sku: sku.into(),
            kind,
            quantity,
            destination: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn export(sku: impl Into<String>, quantity: i64, destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::new(sku, MovementKind::Export, quantity)
        }
    }

    /// Signed change to availability; `None` if it does not fit an `i64`.
    pub fn delta(&self) -> Option<i64> {
        match self.kind {
            MovementKind::Receipt | MovementKind::Adjustment => Some(self.quantity),
            MovementKind::Issue | MovementKind::Export => self.quantity.checked_neg(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        match self.kind {
            MovementKind::Adjustment if self.quantity == 0 => {
                Err(DomainError::validation("adjustment cannot be zero"))
            }
            MovementKind::Adjustment => Ok(()),
            _ if self.quantity <= 0 => Err(DomainError::validation("quantity must be positive")),
            MovementKind::Export if self.destination.as_deref().is_none_or(|d| d.trim().is_empty()) => {
                Err(DomainError::validation("export needs a destination"))
            }
            _ => Ok(()),
        }
    }

    /// Availability after this movement.
    pub fn apply_to(&self, available: i64) -> Result<i64, DomainError> {
        self.validate()?;
        let next = self
            .delta()
            .and_then(|delta| available.checked_add(delta))
            .ok_or_else(|| DomainError::invariant(format!("stock of {} overflows", self.sku)))?;
        if next < 0 {
            return Err(DomainError::invariant(format!("stock of {} cannot go negative", self.sku)));
        }
        Ok(next)
    }
}

#[derive(Debug, Error)]
pub enum MovementError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cascade(#[from] CascadeError),

    #[error("failed to encode movement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Record `movement` in `uow` and report it to the cascade rules.
///
/// Returns the new availability. Nothing is persisted or cascaded unless the
/// caller commits the unit of work.
pub async fn record_movement<B: InventoryStore>(
    uow: &mut UnitOfWork<'_, B>,
    movement: &StockMovement,
) -> Result<i64, MovementError> {
    let store = uow.store();
    let available = store.lock_stock(uow.tx(), &movement.sku).await?;
    let next = movement.apply_to(available)?;

    store.set_stock(uow.tx(), &movement.sku, next).await?;
    store.insert_movement(uow.tx(), movement).await?;
    uow.record(Mutation::created(StockMovement::ENTITY_TYPE, movement)?).await?;

    debug!(movement_id = %movement.id, sku = %movement.sku, kind = movement.kind.as_str(), available = next, "stock movement recorded");
    Ok(next)
}
