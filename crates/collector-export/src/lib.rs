//! Delivery of encoded intercept records to mediators.
//!
//! This crate provides:
//! - Exporter: single-threaded event loop fed by producer queues
//! - DestinationRegistry: the set of mediators, keyed by destination id
//! - Destination: one mediator connection with its backlog
//! - ExportSender: producer handle used by packet-processing threads
//!
//! # Usage
//!
//! ```ignore
//! use collector_export::{DestinationConfig, Exporter, ExporterConfig};
//!
//! let mut exporter = Exporter::with_destinations(
//!     ExporterConfig::default(),
//!     [DestinationConfig::new(1, "10.0.0.5", 9000)],
//! );
//! let sender = exporter.register_queue();
//! let handle = exporter.spawn(halt.clone())?;
//!
//! // On a worker thread
//! sender.blocking_send(ExportMessage::Record(record))?;
//! ```

mod config;
mod destination;
mod error;
mod exporter;
mod message;
mod registry;

pub use config::{
    ExporterConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FLUSH_BUDGET, DEFAULT_MAX_READ_BATCH,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_TICK_INTERVAL_MS,
};
pub use destination::{
    ConnectAttempt, ConnectionState, Delivery, Destination, DestinationConfig, DestinationStats,
    MediatorSocket,
};
pub use error::{ExportError, ExportResult};
pub use exporter::{ExitPolicy, ExportStats, Exporter, EXPORTER_THREAD_NAME};
pub use message::{CapturedPacket, ExportMessage, ExportSender};
pub use registry::{DestinationRegistry, UpsertOutcome};

// Re-export the record types producers need
pub use export_buffer::{BufferConfig, DestinationId, ExportRecord, Framing, RelayHeader};
