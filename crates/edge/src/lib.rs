//! `backbone-edge`: offline-first recording for edge components.
//!
//! A point-of-sale terminal and a telemetry agent share the same machinery:
//! - [`EdgeRecorder`] applies an operation on the primary path and falls back
//!   to the [`LocalBuffer`] when the primary is unreachable.
//! - [`SyncWorker`] replays the buffer in insertion order, deleting each
//!   operation only after the primary accepted it, and stops at the first
//!   failure so later operations never overtake earlier ones.

pub mod buffer;
pub mod payloads;
pub mod primary;
pub mod recorder;
pub mod sync;

pub use buffer::{BufferError, BufferedOperation, EdgeOperation, LocalBuffer, default_buffer_path};
pub use payloads::{PosOperation, SaleLine, TelemetrySample};
pub use primary::{HttpPrimary, Primary, PrimaryEndpoint, PrimaryError};
pub use recorder::{EdgeRecorder, RecordError, Recorded};
pub use sync::{DrainReport, SyncConfig, SyncHandle, SyncWorker};
