//! Error types for export-buffer.

use thiserror::Error;

/// Errors that can occur while framing, buffering or flushing records.
#[derive(Error, Debug)]
pub enum BufferError {
    /// The backlog could not grow to hold the record
    #[error("backlog cannot grow: {requested} bytes requested, capacity {capacity} bytes")]
    OutOfMemory { requested: usize, capacity: usize },

    /// Buffered bytes could not be split into records
    #[error("failed to decode buffered record at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    /// Relay framing requires every record to carry a header
    #[error("record for destination {0} has no relay header")]
    MissingHeader(u32),

    /// A length field would overflow its 16-bit wire representation
    #[error("{field} too large: {size} bytes, max {max} bytes")]
    RecordTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    /// IO error from the socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    pub(crate) fn decode(offset: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            offset,
            reason: reason.into(),
        }
    }
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;
