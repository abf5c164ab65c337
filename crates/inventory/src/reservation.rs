//! Soft-lock reservations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use backbone_core::{DomainError, ReservationId};
use backbone_jobs::{EnqueueError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Holding stock until completion or expiry.
    Active,
    /// Finalized through the normal path; the stock is consumed.
    Completed,
    /// Expired; the stock went back to availability.
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Released => "released",
        }
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "completed" => Ok(ReservationStatus::Completed),
            "released" => Ok(ReservationStatus::Released),
            other => Err(format!("unknown reservation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub sku: String,
    pub quantity: i64,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(sku: impl Into<String>, quantity: i64, ttl: Duration, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let sku = sku.into();
        if sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("reserved quantity must be positive"));
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| DomainError::validation(format!("ttl out of range: {e}")))?;
        if ttl <= chrono::Duration::zero() {
            return Err(DomainError::validation("ttl must be positive"));
        }

        Ok(Self {
            id: ReservationId::new(),
            sku,
            quantity,
            status: ReservationStatus::Active,
            expires_at: now + ttl,
            created_at: now,
            finished_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Finalize. Completing twice is fine; completing a released one is not.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<bool, ReservationError> {
        match self.status {
            ReservationStatus::Active => {
                self.status = ReservationStatus::Completed;
                self.finished_at = Some(now);
                Ok(true)
            }
            ReservationStatus::Completed => Ok(false),
            ReservationStatus::Released => Err(ReservationError::Expired(self.id)),
        }
    }

    /// Expire. Returns `false` when the reservation is no longer active.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = ReservationStatus::Released;
        self.finished_at = Some(now);
        true
    }
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock { sku: String, requested: i64, available: i64 },

    #[error("reservation not found: {0}")]
    NotFound(ReservationId),

    /// The release job already ran.
    #[error("reservation {0} expired and was released")]
    Expired(ReservationId),

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}
