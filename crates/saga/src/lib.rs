//! `backbone-saga`: transactional fan-out of multi-step workflows.

pub mod coordinator;
pub mod offboarding;

pub use coordinator::{Saga, SagaCoordinator, SagaProgress, SagaStart, saga_progress};
