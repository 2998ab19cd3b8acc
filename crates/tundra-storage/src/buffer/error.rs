//! Buffer manager errors.

use thiserror::Error;

use tundra_common::types::PageId;

use crate::file::IoError;

/// Result type for buffer manager operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during buffer manager operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BufferError {
    /// Cooperative retry signal.
    ///
    /// Raised when an optimistic validation fails, an exclusive upgrade
    /// loses a race, the free list runs near-empty, or a page load in
    /// progress has not completed yet. Callers unwind to the top of
    /// their traversal and retry; this is expected control flow, not a
    /// failure.
    #[error("optimistic restart")]
    Restart,

    /// I/O error against the backing store.
    #[error("storage I/O error: {source}")]
    Io {
        #[from]
        source: IoError,
    },

    /// Page image failed validation after a read.
    #[error("page {page_id} is corrupted: {reason}")]
    Corrupted { page_id: PageId, reason: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BufferError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            page_id,
            reason: reason.into(),
        }
    }

    /// Returns true if the caller should retry from the top of its
    /// traversal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Restart)
    }

    /// Returns true if this error indicates corruption or an invariant
    /// violation from which there is no recovery at this layer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}
