//! Exporter error types.

use std::time::Duration;

use export_buffer::{BufferError, DestinationId};
use thiserror::Error;

/// Exporter error type.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Destination address could not be resolved
    #[error("Failed to resolve {endpoint}: {source}")]
    Resolution {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect was refused or failed
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect did not complete in time
    #[error("Timed out connecting to {endpoint} after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// Socket write failed with something other than would-block
    #[error("Send to destination {dest_id} failed: {source}")]
    Send {
        dest_id: DestinationId,
        #[source]
        source: std::io::Error,
    },

    /// Record routed to a destination that is not configured
    #[error("No such destination: {0}")]
    UnknownDestination(DestinationId),

    /// Producer queue is closed or full
    #[error("Queue error: {0}")]
    Queue(String),

    /// Backlog buffer error
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Event loop runtime could not be created
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ExportError.
pub type ExportResult<T> = Result<T, ExportError>;
