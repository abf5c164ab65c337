//! Tracing and logging setup shared by every backbone process.

/// Initialize process-wide logging with the default (JSON) format.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

pub use self::tracing::{LogFormat, init as init_with_format};

/// Tracing subscriber configuration (filters, formats).
pub mod tracing;
