//! The scheduled release of an expired reservation.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use backbone_core::ReservationId;
use backbone_jobs::{Handler, JobArgs, JobContext, JobError};

use crate::store::InventoryStore;

/// Enqueued by every reservation, due at its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReservation {
    pub reservation_id: ReservationId,
}

impl JobArgs for ReleaseReservation {
    const KIND: &'static str = "reservation-release";
}

/// Releases a reservation that is still active when its TTL fires.
///
/// The status check and the stock credit happen under the reservation's row
/// lock in the job's transaction, so a concurrent completion either wins
/// before the check (release is a no-op) or waits and then fails as expired.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseReservationHandler;

#[async_trait]
impl<B: InventoryStore> Handler<B> for ReleaseReservationHandler {
    type Args = ReleaseReservation;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: ReleaseReservation) -> Result<(), JobError> {
        let store = ctx.backend();
        let tx = ctx.tx().await?;

        let Some(mut reservation) = store.lock_reservation(tx, args.reservation_id).await? else {
            warn!(reservation_id = %args.reservation_id, "reservation to release does not exist");
            return Ok(());
        };

        if !reservation.release(Utc::now()) {
            info!(
                reservation_id = %reservation.id,
                status = reservation.status.as_str(),
                "reservation already finalized, nothing to release"
            );
            return Ok(());
        }

        let available = store.lock_stock(tx, &reservation.sku).await?;
        let restored = available
            .checked_add(reservation.quantity)
            .ok_or_else(|| JobError::validation(format!("stock of {} overflows on release", reservation.sku)))?;
        store.set_stock(tx, &reservation.sku, restored).await?;
        store.update_reservation(tx, &reservation).await?;

        info!(
            reservation_id = %reservation.id,
            sku = %reservation.sku,
            quantity = reservation.quantity,
            "expired reservation released"
        );
        Ok(())
    }
}
