//! Error types for context acquisition and store close.

use crate::holder::HolderReport;
use thiserror::Error;

/// Failures surfaced by context acquisition and store close.
///
/// None of these are retried internally beyond the bounded close loop, and
/// callers must not try to repair the lock state after seeing one.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The store was closed underneath an attempted acquisition.
    #[error("store is closed")]
    Closed,

    /// The per-thread chain would grow past its cap. A context was most
    /// likely acquired and never released.
    #[error(
        "more than {limit} nested contexts are not supported; \
         most likely a context was acquired and never released"
    )]
    Overflow {
        /// Maximum number of contexts a chain may hold.
        limit: usize,
    },

    /// Close was called by the thread that still holds an active context.
    #[error("attempt to close the store from an unfinished query or iteration on the same thread")]
    SameThreadClose,

    /// A context was still held when the close deadline passed.
    #[error("failed to close a context: {0}")]
    CloseTimeout(Box<HolderReport>),
}

/// Result type for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

impl ContextError {
    /// Check if this is a closed-store error.
    pub fn is_closed(&self) -> bool {
        matches!(self, ContextError::Closed)
    }

    /// Diagnostics of the holder that blocked a close, if any.
    pub fn holder_report(&self) -> Option<&HolderReport> {
        match self {
            ContextError::CloseTimeout(report) => Some(report),
            _ => None,
        }
    }
}
