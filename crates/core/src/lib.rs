//! `backbone-core`: identifiers and the domain error model.
//!
//! Every crate that touches the shared store depends on it; keep its
//! dependencies to serde, uuid and thiserror.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, MovementId, ReservationId};
