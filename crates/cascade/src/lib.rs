//! `backbone-cascade`: side effects triggered by entity mutations.
//!
//! Rules are registered once at startup against an entity type and an
//! operation. Recording a mutation in a [`UnitOfWork`] evaluates them:
//! job-backed rules are enqueued into the same transaction, detached rules
//! run after a successful commit. A rolled-back unit of work fires nothing.

pub mod mutation;
pub mod rules;
pub mod unit_of_work;

pub use mutation::{Mutation, Operation};
pub use rules::{CascadeAction, CascadeError, CascadeRule, Cascades, CascadesBuilder, SideEffect};
pub use unit_of_work::UnitOfWork;
