//! Record-aligned backlog buffering for intercept record export.
//!
//! When a mediator cannot take data as fast as the collector produces it,
//! encoded records are parked in an [`ExportBuffer`] and flushed later in
//! the exact order they were produced. The mediator must never see a torn
//! record, so flushing works on whole records:
//!
//! ```text
//!   append()                                   transmitted_bytes()
//!      │                                               │
//!      ▼                                               ▼
//! ┌─────────┬───────────────┬──────────┬──────────┬────────┐
//! │  sent   │ rec 0 (part)  │  rec 1   │  rec 2   │  free  │ ──► socket
//! └─────────┴───────────────┴──────────┴──────────┴────────┘
//!           ▲       ▲
//!       deadfront  deadfront + partial_front
//! ```
//!
//! Record boundaries are recovered from the bytes themselves, either from
//! the 16-byte relay header or from the BER length of the record. See the
//! [`protocol`] module for both framings.
//!
//! # Usage
//!
//! ```ignore
//! use export_buffer::{BufferConfig, ExportBuffer, ExportRecord, Framing, RelayHeader};
//!
//! let mut backlog = ExportBuffer::new(Framing::RelayHeader, BufferConfig::default());
//!
//! let record = ExportRecord::new(1, body).with_header(RelayHeader::new(2, 7));
//! backlog.append(&record, 0)?;
//!
//! // Later, once the socket is writable again
//! let sent = backlog.transmitted_bytes(&mut socket, 64 * 1024)?;
//! ```
//!
//! # Thread Safety
//!
//! A buffer belongs to exactly one destination and is only touched by the
//! exporter thread. It is `Send` but takes `&mut self` for every mutation.

pub mod error;
pub mod protocol;

mod buffer;
mod record;

pub use buffer::{BufferConfig, ExportBuffer};
pub use error::{BufferError, BufferResult};
pub use protocol::{ber_pdu_length, Framing, RelayHeader};
pub use record::{DestinationId, ExportRecord};
