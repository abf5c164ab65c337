//! `backbone-worker`: the process that runs every backbone job kind.
//!
//! Also hosts the operator commands (discarded jobs, requeue, stats) and the
//! edge sync loop for a terminal or agent host.

pub mod clients;
pub mod config;
pub mod inspect;
pub mod wiring;


pub use config::WorkerConfig;
pub use wiring::{Collaborators, MemoryWorkerBackend, Worker, WorkerStore, WorkerTables, ensure_schema};
