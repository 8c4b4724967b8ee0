//! A single mediator endpoint.
//!
//! Each destination owns its TCP connection and its backlog. Records are
//! written straight to the socket while it keeps up; anything the socket
//! will not take right now is parked in the backlog and flushed on later
//! ticks, always ahead of newer records.
//!
//! ```text
//!   Disconnected ──begin_connect()──► Connecting ──finish_connect(ok)──► Connected
//!        ▲                                  │                               │
//!        └──────────── failure ─────────────┘                               │
//!        └──────────────────────────── send error ──────────────────────────┘
//! ```
//!
//! Opening the socket is split from the state change so the event loop can
//! run [`ConnectAttempt::run`] off to the side and apply the outcome later.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use export_buffer::{
    BufferConfig, BufferError, DestinationId, ExportBuffer, ExportRecord, Framing,
};
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{ExportError, ExportResult, DEFAULT_FLUSH_BUDGET};

/// Where a destination lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Routing key used by records
    pub id: DestinationId,
    /// IPv4/IPv6 literal or hostname
    pub address: String,
    pub port: u16,
}

impl DestinationConfig {
    pub fn new(id: DestinationId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Whether both configs point at the same socket address.
    ///
    /// IP literals are compared after canonicalisation, so an IPv4-mapped
    /// IPv6 address matches its IPv4 form.
    pub fn same_endpoint(&self, other: &DestinationConfig) -> bool {
        if self.port != other.port {
            return false;
        }
        match (
            self.address.parse::<IpAddr>(),
            other.address.parse::<IpAddr>(),
        ) {
            (Ok(a), Ok(b)) => a.to_canonical() == b.to_canonical(),
            _ => self.address.eq_ignore_ascii_case(&other.address),
        }
    }
}

/// Connection state of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// What happened to a record handed to [`Destination::send_or_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fully written to the socket
    Sent,
    /// Parked in the backlog, possibly after a partial write
    Buffered,
    /// Could not be sent or stored
    Dropped,
}

/// Per-destination counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub records_sent: u64,
    pub records_buffered: u64,
    pub records_dropped: u64,
    pub backlog_bytes_flushed: u64,
    pub connects: u64,
}

/// Connected mediator stream used as a non-blocking [`Write`] sink.
///
/// `write` never waits: a full socket buffer surfaces as `WouldBlock`.
#[derive(Debug)]
pub struct MediatorSocket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl MediatorSocket {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Write for MediatorSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum WriteOutcome {
    Complete,
    /// Socket stopped accepting data after this many bytes
    Stalled(usize),
    /// Hard error after this many bytes
    Failed(usize, io::Error),
}

/// Outcome of opening a connection for a destination config.
#[derive(Debug)]
pub struct ConnectAttempt {
    /// Endpoint the attempt was made for
    pub config: DestinationConfig,
    pub result: ExportResult<MediatorSocket>,
}

impl ConnectAttempt {
    /// Resolve and connect to the endpoint in `config`.
    pub async fn run(config: DestinationConfig, connect_timeout: Duration) -> Self {
        let result = open_endpoint(&config, connect_timeout).await;
        Self { config, result }
    }
}

fn write_nonblocking<W: Write>(sink: &mut W, bytes: &[u8]) -> WriteOutcome {
    let mut written = 0;
    while written < bytes.len() {
        match sink.write(&bytes[written..]) {
            Ok(0) => {
                return WriteOutcome::Failed(
                    written,
                    io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"),
                )
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return WriteOutcome::Stalled(written)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return WriteOutcome::Failed(written, e),
        }
    }
    WriteOutcome::Complete
}

/// One mediator endpoint with its connection and backlog.
#[derive(Debug)]
pub struct Destination {
    config: DestinationConfig,
    socket: Option<MediatorSocket>,
    state: ConnectionState,
    /// Set once the current outage has been logged
    failure_logged: bool,
    backlog: ExportBuffer,
    stats: DestinationStats,
    /// Backlog bytes written per flush
    flush_budget: usize,
    scratch: Vec<u8>,
}

impl Destination {
    /// Create a disconnected destination.
    pub fn new(config: DestinationConfig, framing: Framing, buffer: BufferConfig) -> Self {
        Self {
            config,
            socket: None,
            state: ConnectionState::Disconnected,
            failure_logged: false,
            backlog: ExportBuffer::new(framing, buffer),
            stats: DestinationStats::default(),
            flush_budget: DEFAULT_FLUSH_BUDGET,
            scratch: Vec::new(),
        }
    }

    pub fn set_flush_budget(&mut self, budget: usize) {
        self.flush_budget = budget.max(1);
    }

    pub fn id(&self) -> DestinationId {
        self.config.id
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn backlog(&self) -> &ExportBuffer {
        &self.backlog
    }

    pub fn stats(&self) -> DestinationStats {
        self.stats
    }

    /// Mark a disconnected destination as connecting and return the
    /// endpoint to open. Returns `None` while connected or connecting.
    pub fn begin_connect(&mut self) -> Option<DestinationConfig> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Connecting;
        Some(self.config.clone())
    }

    /// Apply the outcome of an attempt started with [`begin_connect`].
    ///
    /// The partial-send hint only holds within one connection: on a new
    /// connection the leading record is resent whole. A failure is logged
    /// once per outage.
    ///
    /// [`begin_connect`]: Destination::begin_connect
    pub fn finish_connect(&mut self, result: ExportResult<MediatorSocket>) -> ConnectionState {
        if self.state == ConnectionState::Connected {
            return self.state;
        }

        match result {
            Ok(socket) => {
                info!(
                    dest_id = self.config.id,
                    endpoint = %self.config.endpoint(),
                    peer = %socket.peer_addr(),
                    backlog = self.backlog.buffered(),
                    "Connected to mediator"
                );
                if self.backlog.partial_front() > 0 {
                    debug!(
                        dest_id = self.config.id,
                        "Resending partially sent record on new connection"
                    );
                }
                // The old stream took the torn record with it
                self.backlog.rewind_partial();
                self.socket = Some(socket);
                self.state = ConnectionState::Connected;
                self.failure_logged = false;
                self.stats.connects += 1;
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                if !self.failure_logged {
                    warn!(
                        dest_id = self.config.id,
                        endpoint = %self.config.endpoint(),
                        error = %e,
                        "Failed to connect to mediator, will retry"
                    );
                    self.failure_logged = true;
                } else {
                    debug!(dest_id = self.config.id, error = %e, "Mediator still unreachable");
                }
            }
        }
        self.state
    }

    /// Give up on an attempt whose outcome will never arrive.
    pub fn abandon_connect(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Connect in place and wait for the outcome.
    ///
    /// Every resolved address is tried in turn, each bounded by
    /// `connect_timeout`. The partial-send hint only applies within a single
    /// connection, so a reconnect resends the leading record whole.
    pub async fn connect(&mut self, connect_timeout: Duration) -> ConnectionState {
        let Some(config) = self.begin_connect() else {
            return self.state;
        };
        let result = open_endpoint(&config, connect_timeout).await;
        self.finish_connect(result)
    }

    /// Deliver a record, or park it in the backlog.
    ///
    /// Backlogged bytes always go out first. If anything is still queued
    /// after draining, the record joins the queue behind it.
    pub fn send_or_buffer(&mut self, record: &ExportRecord) -> Delivery {
        if let Err(e) = record.validate_for(self.backlog.framing()) {
            warn!(dest_id = self.config.id, error = %e, "Dropping malformed record");
            self.stats.records_dropped += 1;
            return Delivery::Dropped;
        }

        if self.state != ConnectionState::Connected {
            return self.park(record, 0);
        }

        if !self.backlog.is_empty() {
            if let Err(e) = self.flush(self.flush_budget) {
                debug!(dest_id = self.config.id, error = %e, "Backlog drain failed");
            }
            if !self.backlog.is_empty() {
                return self.park(record, 0);
            }
        }

        self.scratch.clear();
        if let Err(e) = record.encode_head_into(&mut self.scratch) {
            warn!(dest_id = self.config.id, error = %e, "Dropping unencodable record");
            self.stats.records_dropped += 1;
            return Delivery::Dropped;
        }

        let Some(socket) = self.socket.as_mut() else {
            return self.park(record, 0);
        };

        let head_len = self.scratch.len();
        match write_nonblocking(socket, &self.scratch) {
            WriteOutcome::Complete => {}
            WriteOutcome::Stalled(sent) => return self.park(record, sent),
            WriteOutcome::Failed(sent, e) => {
                self.disconnect_after_error(&e);
                return self.park(record, sent);
            }
        }

        let trailer = record.trailer();
        if !trailer.is_empty() {
            match write_nonblocking(socket, trailer) {
                WriteOutcome::Complete => {}
                WriteOutcome::Stalled(sent) => return self.park(record, head_len + sent),
                WriteOutcome::Failed(sent, e) => {
                    self.disconnect_after_error(&e);
                    return self.park(record, head_len + sent);
                }
            }
        }

        trace!(dest_id = self.config.id, len = record.wire_len(), "Exported record");
        self.stats.records_sent += 1;
        Delivery::Sent
    }

    fn park(&mut self, record: &ExportRecord, already_sent: usize) -> Delivery {
        match self.backlog.append(record, already_sent) {
            Ok(buffered) => {
                trace!(dest_id = self.config.id, buffered = buffered, "Buffered record");
                self.stats.records_buffered += 1;
                Delivery::Buffered
            }
            Err(e) => {
                // Out-of-memory is reported by the backlog itself
                if !matches!(e, BufferError::OutOfMemory { .. }) {
                    warn!(dest_id = self.config.id, error = %e, "Dropping record");
                }
                self.stats.records_dropped += 1;

                if already_sent > 0 && self.socket.is_some() {
                    warn!(
                        dest_id = self.config.id,
                        "Resetting mediator connection after dropping a partially sent record"
                    );
                    self.close();
                }
                Delivery::Dropped
            }
        }
    }

    /// Write backlogged records, up to `budget` bytes.
    ///
    /// The budget is raised to the size of the leading record so that one
    /// oversized record cannot stall the backlog forever.
    pub fn flush(&mut self, budget: usize) -> ExportResult<usize> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(0);
        };

        let leading = self.backlog.next_record_len().ok().flatten().unwrap_or(0);
        match self.backlog.transmitted_bytes(socket, budget.max(leading)) {
            Ok(sent) => {
                self.stats.backlog_bytes_flushed += sent as u64;
                Ok(sent)
            }
            Err(BufferError::Io(source)) => {
                self.disconnect_after_error(&source);
                Err(ExportError::Send {
                    dest_id: self.config.id,
                    source,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush one budget's worth of backlog if connected.
    pub fn flush_backlog(&mut self) {
        if self.state != ConnectionState::Connected || self.backlog.is_empty() {
            return;
        }
        match self.flush(self.flush_budget) {
            Ok(0) => {}
            Ok(sent) => debug!(
                dest_id = self.config.id,
                sent = sent,
                remaining = self.backlog.buffered(),
                "Flushed backlog"
            ),
            Err(e) => debug!(dest_id = self.config.id, error = %e, "Backlog flush failed"),
        }
    }

    /// Point the destination at a new endpoint.
    ///
    /// Returns false, and leaves the connection alone, when the endpoint is
    /// unchanged. The backlog is kept either way.
    pub fn reconfigure(&mut self, config: DestinationConfig) -> bool {
        if self.config.same_endpoint(&config) {
            return false;
        }

        info!(
            dest_id = self.config.id,
            old = %self.config.endpoint(),
            new = %config.endpoint(),
            "Mediator endpoint changed"
        );
        self.close();
        self.config = config;
        self.failure_logged = false;
        true
    }

    /// Drop the connection. The backlog is kept.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(dest_id = self.config.id, "Closed mediator connection");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn disconnect_after_error(&mut self, err: &io::Error) {
        warn!(
            dest_id = self.config.id,
            endpoint = %self.config.endpoint(),
            error = %err,
            "Error exporting to mediator, disconnecting"
        );
        self.failure_logged = true;
        self.close();
    }
}

/// Resolve `config` and connect to the first address that answers.
async fn open_endpoint(
    config: &DestinationConfig,
    connect_timeout: Duration,
) -> ExportResult<MediatorSocket> {
    let endpoint = config.endpoint();
    let lookup = lookup_host((config.address.as_str(), config.port));

    let addrs: Vec<SocketAddr> = match timeout(connect_timeout, lookup).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(source)) => return Err(ExportError::Resolution { endpoint, source }),
        Err(_) => {
            return Err(ExportError::ConnectTimeout {
                endpoint,
                timeout: connect_timeout,
            })
        }
    };

    let mut last_error = ExportError::Resolution {
        endpoint: endpoint.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
    };

    for addr in addrs {
        match timeout(connect_timeout, connect_with_keepalive(addr)).await {
            Ok(Ok(stream)) => return Ok(MediatorSocket { stream, peer: addr }),
            Ok(Err(source)) => {
                last_error = ExportError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                }
            }
            Err(_) => {
                last_error = ExportError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout: connect_timeout,
                }
            }
        }
    }

    Err(last_error)
}

async fn connect_with_keepalive(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}
