//! `backbone-submission`: exactly-once effects on systems that are not transactional.
//!
//! A submission job first looks for a persisted [`IdempotencyMarker`] on the
//! entity it concerns. If one exists the external effect already happened and
//! the job completes without calling out. Otherwise it calls the external
//! system with a key derived from the entity, and records the returned
//! reference in the job's own unit of work.

pub mod customs;
pub mod external;
pub mod marker;
pub mod submitter;

pub use customs::CustomsDeclaration;
pub use external::{ExternalError, ExternalSystem, SubmissionRequest, SubmissionTarget};
pub use marker::{IdempotencyMarker, MarkerStore, MarkerTables, ensure_schema};
pub use submitter::IdempotentSubmitter;
