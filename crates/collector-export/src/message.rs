//! Messages producers hand to the exporter.

use std::fmt;

use export_buffer::{DestinationId, ExportRecord};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::destination::DestinationConfig;
use crate::{ExportError, ExportResult};

/// A captured packet whose memory is owned by the capture layer.
///
/// Several records may be built from one packet. The producer sends a
/// [`ExportMessage::PacketFin`] after the last of them, and the exporter
/// releases the packet once it reaches that message, so the packet is never
/// freed while a queued record could still refer to it.
pub trait CapturedPacket: Send + 'static {
    /// Return the packet to the capture layer.
    fn release(self: Box<Self>);
}

/// One entry on a producer queue.
pub enum ExportMessage {
    /// Encoded record to deliver
    Record(ExportRecord),
    /// Every record for this packet has been queued
    PacketFin(Box<dyn CapturedPacket>),
    /// A mediator was announced or its endpoint changed
    Mediator(DestinationConfig),
    /// A mediator was removed from the configuration
    WithdrawMediator(DestinationId),
}

impl fmt::Debug for ExportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(record) => f
                .debug_struct("Record")
                .field("dest_id", &record.dest_id)
                .field("wire_len", &record.wire_len())
                .finish(),
            Self::PacketFin(_) => f.write_str("PacketFin"),
            Self::Mediator(config) => f.debug_tuple("Mediator").field(config).finish(),
            Self::WithdrawMediator(id) => f.debug_tuple("WithdrawMediator").field(id).finish(),
        }
    }
}

/// Producer handle for one exporter queue.
///
/// Cloning shares the queue: messages from all clones stay in the order
/// each clone sent them. A queue is closed once every clone is dropped.
#[derive(Debug, Clone)]
pub struct ExportSender {
    source: usize,
    tx: mpsc::Sender<ExportMessage>,
}

impl ExportSender {
    pub(crate) fn new(source: usize, tx: mpsc::Sender<ExportMessage>) -> Self {
        Self { source, tx }
    }

    /// Index of the queue this sender feeds.
    pub fn source(&self) -> usize {
        self.source
    }

    /// Queue a message, waiting for space.
    pub async fn send(&self, message: ExportMessage) -> ExportResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ExportError::Queue(format!("exporter queue {} closed", self.source)))
    }

    /// Queue a message from a non-async worker thread, waiting for space.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_send(&self, message: ExportMessage) -> ExportResult<()> {
        self.tx
            .blocking_send(message)
            .map_err(|_| ExportError::Queue(format!("exporter queue {} closed", self.source)))
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: ExportMessage) -> ExportResult<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                ExportError::Queue(format!("exporter queue {} full", self.source))
            }
            TrySendError::Closed(_) => {
                ExportError::Queue(format!("exporter queue {} closed", self.source))
            }
        })
    }

    /// Queue a record for export.
    pub async fn export(&self, record: ExportRecord) -> ExportResult<()> {
        self.send(ExportMessage::Record(record)).await
    }

    /// Signal that every record derived from `packet` has been queued.
    pub async fn packet_finished(&self, packet: Box<dyn CapturedPacket>) -> ExportResult<()> {
        self.send(ExportMessage::PacketFin(packet)).await
    }
}
