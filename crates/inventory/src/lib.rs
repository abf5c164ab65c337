//! `backbone-inventory`: stock levels, soft-lock reservations and movements.
//!
//! Reservations hold stock for a limited time. Reserving enqueues a
//! [`ReleaseReservation`] job due when the hold expires; whichever of the
//! release and [`complete_reservation`] takes the reservation's row lock first
//! decides its fate, and the other becomes a no-op or an error.
//!
//! Recorded stock movements are reported to the cascade layer, which is how
//! exports reach customs without this crate knowing about it.

pub mod movement;
pub mod release;
pub mod reservation;
pub mod service;
pub mod store;

pub use movement::{MovementError, MovementKind, StockMovement, record_movement};
pub use release::{ReleaseReservation, ReleaseReservationHandler};
pub use reservation::{Reservation, ReservationError, ReservationStatus};
pub use service::{complete_reservation, reserve_with_ttl, reserve_with_ttl_in};
pub use store::{InventoryStore, InventoryTables, ensure_schema};
