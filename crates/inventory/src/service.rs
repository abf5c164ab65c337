//! Reservation operations.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use backbone_core::ReservationId;
use backbone_jobs::{EnqueueOptions, JobQueue};

use crate::release::ReleaseReservation;
use crate::reservation::{Reservation, ReservationError};
use crate::store::InventoryStore;

/// Hold `quantity` of `sku` for `ttl` in the caller's transaction.
///
/// Decrements availability, records an active reservation and enqueues its
/// release due at expiry. All three commit or roll back with `tx`.
pub async fn reserve_with_ttl_in<B: InventoryStore>(
    queue: &JobQueue<B>,
    tx: &mut B::Tx,
    sku: &str,
    quantity: i64,
    ttl: Duration,
) -> Result<Reservation, ReservationError> {
    let store = queue.backend();
    let reservation = Reservation::new(sku, quantity, ttl, Utc::now())?;

    let available = store.lock_stock(tx, sku).await?;
    if available < quantity {
        return Err(ReservationError::InsufficientStock {
            sku: sku.to_string(),
            requested: quantity,
            available,
        });
    }

    store.set_stock(tx, sku, available - quantity).await?;
    store.insert_reservation(tx, &reservation).await?;
    let job_id = queue
        .enqueue_in(
            tx,
            &ReleaseReservation { reservation_id: reservation.id },
            EnqueueOptions::at(reservation.expires_at),
        )
        .await?;

    debug!(reservation_id = %reservation.id, %job_id, sku, quantity, expires_at = %reservation.expires_at, "reservation placed");
    Ok(reservation)
}

/// [`reserve_with_ttl_in`] in its own transaction.
pub async fn reserve_with_ttl<B: InventoryStore>(
    queue: &JobQueue<B>,
    sku: &str,
    quantity: i64,
    ttl: Duration,
) -> Result<Reservation, ReservationError> {
    let backend = queue.backend();
    let mut tx = backend.begin().await?;
    let reservation = reserve_with_ttl_in(queue, &mut tx, sku, quantity, ttl).await?;
    backend.commit(tx).await?;
    Ok(reservation)
}

/// Finalize a reservation through the normal path.
///
/// Completing an already completed reservation returns it unchanged. Fails
/// with [`ReservationError::Expired`] once the release has run.
pub async fn complete_reservation<B: InventoryStore>(store: &B, id: ReservationId) -> Result<Reservation, ReservationError> {
    let mut tx = store.begin().await?;
    let mut reservation = store
        .lock_reservation(&mut tx, id)
        .await?
        .ok_or(ReservationError::NotFound(id))?;

    if reservation.complete(Utc::now())? {
        store.update_reservation(&mut tx, &reservation).await?;
        store.commit(tx).await?;
        info!(reservation_id = %id, sku = %reservation.sku, quantity = reservation.quantity, "reservation completed");
    } else {
        store.rollback(tx).await?;
    }
    Ok(reservation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{MovementKind, StockMovement, record_movement};
    use crate::release::ReleaseReservationHandler;
    use crate::reservation::ReservationStatus;
    use crate::store::InventoryTables;
    use backbone_cascade::{CascadesBuilder, UnitOfWork};
    use backbone_jobs::{
        Backend, Dispatcher, DispatcherConfig, JobFilter, JobState, JobStore, MemoryBackend, Registry,
    };

    type Memory = MemoryBackend<InventoryTables>;

    async fn dispatcher_with_stock(sku: &str, on_hand: i64) -> Dispatcher<Memory> {
        let registry = Registry::<Memory>::builder()
            .register(ReleaseReservationHandler)
            .unwrap()
            .build();
        let queue = JobQueue::new(Memory::arc(), registry.kinds(), 3);

        let cascades = CascadesBuilder::new().build(&queue).unwrap();
        let mut uow = UnitOfWork::begin(&cascades).await.unwrap();
        record_movement(&mut uow, &StockMovement::new(sku, MovementKind::Receipt, on_hand)).await.unwrap();
        uow.commit().await.unwrap();

        Dispatcher::new(queue, registry, DispatcherConfig::default())
    }

    #[tokio::test]
    async fn completion_just_before_expiry_wins_the_race() {
        let dispatcher = dispatcher_with_stock("SKU-1", 10).await;
        let queue = dispatcher.queue();
        let backend = queue.backend();

        let reservation = reserve_with_ttl(queue, "SKU-1", 3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(backend.available("SKU-1").await.unwrap(), 7);

        tokio::time::sleep(Duration::from_millis(900)).await;
        complete_reservation(backend.as_ref(), reservation.id).await.unwrap();

        // Nothing due yet, then the release fires.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dispatcher.drain("w").await.unwrap(), 1);

        let stored = backend.reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Completed);
        assert_eq!(backend.available("SKU-1").await.unwrap(), 7);

        let release = backend.list(&JobFilter::default()).await.unwrap();
        assert_eq!(release.len(), 1);
        assert_eq!(release[0].state, JobState::Completed);
    }

    #[tokio::test]
    async fn expired_reservation_is_released_and_cannot_be_completed() {
        let dispatcher = dispatcher_with_stock("SKU-2", 5).await;
        let queue = dispatcher.queue();
        let backend = queue.backend();

        let reservation = reserve_with_ttl(queue, "SKU-2", 5, Duration::from_millis(50)).await.unwrap();
        assert_eq!(backend.available("SKU-2").await.unwrap(), 0);
        assert_eq!(dispatcher.drain("w").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(dispatcher.drain("w").await.unwrap(), 1);

        assert_eq!(backend.available("SKU-2").await.unwrap(), 5);
        let err = complete_reservation(backend.as_ref(), reservation.id).await.unwrap_err();
        assert!(matches!(err, ReservationError::Expired(id) if id == reservation.id));
        assert_eq!(backend.available("SKU-2").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn insufficient_stock_leaves_no_trace() {
        let dispatcher = dispatcher_with_stock("SKU-3", 2).await;
        let queue = dispatcher.queue();
        let backend = queue.backend();

        let err = reserve_with_ttl(queue, "SKU-3", 3, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ReservationError::InsufficientStock { available: 2, .. }));
        assert_eq!(backend.available("SKU-3").await.unwrap(), 2);
        assert!(backend.list(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reservation_rolled_back_with_its_caller_schedules_nothing() {
        let dispatcher = dispatcher_with_stock("SKU-4", 4).await;
        let queue = dispatcher.queue();
        let backend = queue.backend();

        let mut tx = backend.begin().await.unwrap();
        let reservation = reserve_with_ttl_in(queue, &mut tx, "SKU-4", 1, Duration::from_secs(60)).await.unwrap();
        backend.rollback(tx).await.unwrap();

        assert_eq!(backend.available("SKU-4").await.unwrap(), 4);
        assert!(backend.reservation(reservation.id).await.unwrap().is_none());
        assert!(backend.list(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completing_twice_is_idempotent() {
        let dispatcher = dispatcher_with_stock("SKU-5", 4).await;
        let queue = dispatcher.queue();
        let backend = queue.backend();

        let reservation = reserve_with_ttl(queue, "SKU-5", 2, Duration::from_secs(60)).await.unwrap();
        complete_reservation(backend.as_ref(), reservation.id).await.unwrap();
        let again = complete_reservation(backend.as_ref(), reservation.id).await.unwrap();

        assert_eq!(again.status, ReservationStatus::Completed);
        assert_eq!(backend.available("SKU-5").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_reservation_is_not_found() {
        let dispatcher = dispatcher_with_stock("SKU-6", 1).await;
        let err = complete_reservation(dispatcher.queue().backend().as_ref(), ReservationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::NotFound(_)));
    }
}
