//! Primary-first recording with a local fallback.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{BufferError, EdgeOperation, LocalBuffer};
use crate::primary::{Primary, PrimaryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Accepted by the primary.
    Applied,
    /// Stored locally for the sync worker.
    Buffered { local_id: i64 },
}

#[derive(Debug, Error)]
pub enum RecordError {
    /// The primary refused the operation. Buffering would not help.
    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Records edge operations.
pub struct EdgeRecorder<T: EdgeOperation> {
    primary: Arc<dyn Primary<T>>,
    buffer: LocalBuffer<T>,
}

impl<T: EdgeOperation> Clone for EdgeRecorder<T> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

impl<T: EdgeOperation> EdgeRecorder<T> {
    pub fn new(primary: Arc<dyn Primary<T>>, buffer: LocalBuffer<T>) -> Self {
        Self { primary, buffer }
    }

    pub fn buffer(&self) -> &LocalBuffer<T> {
        &self.buffer
    }

    /// Apply `op` on the primary, or buffer it.
    ///
    /// While older operations are still buffered the new one is appended
    /// behind them without trying the primary, so it cannot overtake them.
    /// Concurrent calls and replay passes take the buffer's ordering lock, so
    /// a later call never reaches the primary ahead of an earlier one.
    pub async fn record(&self, op: &T) -> Result<Recorded, RecordError> {
        let _order = self.buffer.order_lock().await;
        if !self.buffer.is_empty().await? {
            let local_id = self.buffer.append(op).await?;
            debug!(family = T::FAMILY, local_id, "older operations pending, buffered behind them");
            return Ok(Recorded::Buffered { local_id });
        }

        match self.primary.apply(op).await {
            Ok(()) => Ok(Recorded::Applied),
            Err(PrimaryError::Unreachable(reason)) => {
                let local_id = self.buffer.append(op).await?;
                warn!(family = T::FAMILY, local_id, %reason, "primary unreachable, operation buffered");
                Ok(Recorded::Buffered { local_id })
            }
            Err(PrimaryError::Rejected(reason)) => Err(RecordError::Rejected(reason)),
        }
    }
}
