//! Per-destination backlog of records that could not be sent yet.
//!
//! The backlog is one contiguous byte region holding complete records in
//! wire order:
//!
//! ```text
//!  0          deadfront      deadfront+partial_front      len        capacity
//!  ├── sent ──────┼── leading record (partly sent) ──┼── ... ──┼── free ──┤
//! ```
//!
//! - `deadfront` only ever lands on record boundaries. Bytes before it have
//!   been written to the socket and are reclaimed by compaction.
//! - `partial_front` is how far into the leading record the socket got
//!   before it stopped accepting data. A flush resumes exactly there.
//! - Capacity grows in fixed increments and is given back once a large
//!   backlog has drained.

use std::fmt;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{BufferError, BufferResult};
use crate::protocol::Framing;
use crate::record::ExportRecord;

/// Default growth step (10 MiB).
pub const DEFAULT_ALLOC_INCREMENT: usize = 10 * 1024 * 1024;

/// Default capacity at which an operator warning is logged (1 GiB).
pub const DEFAULT_WARNING_THRESHOLD: usize = 1024 * 1024 * 1024;

/// A drained buffer is only reallocated smaller once its capacity exceeds
/// this many growth increments.
const SHRINK_INCREMENTS: usize = 10;

/// Sizing policy for a backlog buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes added to the capacity on every growth step.
    pub alloc_increment: usize,
    /// Capacity at which a warning about a missing mediator is logged.
    pub warning_threshold: usize,
    /// Hard cap on capacity. Growth past it fails with `OutOfMemory`.
    pub max_capacity: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            alloc_increment: DEFAULT_ALLOC_INCREMENT,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            max_capacity: None,
        }
    }
}

/// Growable, record-aligned backlog for one destination.
pub struct ExportBuffer {
    data: Vec<u8>,
    /// Logical allocation; `data.capacity()` is at least this large.
    capacity: usize,
    deadfront: usize,
    partial_front: usize,
    framing: Framing,
    config: BufferConfig,
    oom_reported: bool,
    decode_reported: bool,
}

impl ExportBuffer {
    pub fn new(framing: Framing, config: BufferConfig) -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
            deadfront: 0,
            partial_front: 0,
            framing,
            config,
            oom_reported: false,
            decode_reported: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Bytes not yet reclaimed, including the sent part of the leading record.
    pub fn buffered(&self) -> usize {
        self.data.len() - self.deadfront
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Currently allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dead_front(&self) -> usize {
        self.deadfront
    }

    pub fn partial_front(&self) -> usize {
        self.partial_front
    }

    /// Bytes that still have to reach the socket, in wire order.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.deadfront + self.partial_front..]
    }

    /// Append a record in wire order.
    ///
    /// `already_sent` is how many of the record's leading bytes were written
    /// to the socket before it was diverted here. It only takes effect when
    /// the buffer holds no live bytes, since otherwise the record cannot have
    /// been sent ahead of the backlog.
    ///
    /// Returns the number of bytes now buffered. On error the buffer is left
    /// as it was.
    pub fn append(&mut self, record: &ExportRecord, already_sent: usize) -> BufferResult<usize> {
        record.validate_for(self.framing)?;

        let len = record.wire_len();
        if !self.prepare(len, already_sent)? {
            return Ok(self.buffered());
        }
        record.encode_into(&mut self.data)?;
        Ok(self.buffered())
    }

    /// Make room for `len` more bytes. Returns false when the record was
    /// already sent in full and nothing needs to be stored.
    fn prepare(&mut self, len: usize, already_sent: usize) -> BufferResult<bool> {
        let was_empty = self.is_empty();
        if was_empty && already_sent >= len {
            return Ok(false);
        }
        if was_empty {
            self.data.clear();
            self.deadfront = 0;
        }

        self.reserve(len)?;

        if was_empty {
            self.partial_front = already_sent;
        }
        Ok(true)
    }

    /// Ensure at least `len` bytes fit after the current tail.
    fn reserve(&mut self, len: usize) -> BufferResult<()> {
        let used = self.data.len();
        if self.capacity - used >= len {
            return Ok(());
        }

        let live = self.buffered();
        let needed = match live.checked_add(len) {
            Some(needed) => needed,
            None => return Err(self.out_of_memory(usize::MAX)),
        };

        // Reclaiming the dead front may be enough on its own
        if needed <= self.capacity {
            self.compact();
            return Ok(());
        }

        let increment = self.config.alloc_increment.max(1);
        let steps = (needed - self.capacity).div_ceil(increment);
        let new_capacity = match steps
            .checked_mul(increment)
            .and_then(|extra| self.capacity.checked_add(extra))
        {
            Some(cap) => cap,
            None => return Err(self.out_of_memory(needed)),
        };

        if let Some(max) = self.config.max_capacity {
            if new_capacity > max {
                return Err(self.out_of_memory(needed));
            }
        }

        if self.data.try_reserve_exact(new_capacity - used).is_err() {
            return Err(self.out_of_memory(needed));
        }

        self.compact();
        let old_capacity = self.capacity;
        self.capacity = new_capacity;
        self.oom_reported = false;

        debug!(
            old_capacity = old_capacity,
            new_capacity = new_capacity,
            buffered = live,
            "Grew export buffer"
        );

        let threshold = self.config.warning_threshold;
        if old_capacity < threshold && new_capacity >= threshold {
            warn!(
                capacity = new_capacity,
                threshold = threshold,
                "Buffer space for unreachable mediator has exceeded warning threshold"
            );
        }

        Ok(())
    }

    fn out_of_memory(&mut self, requested: usize) -> BufferError {
        if !self.oom_reported {
            error!(
                requested = requested,
                capacity = self.capacity,
                "No more memory available for export buffer space"
            );
            error!("Fix the connection between the collector and the mediator");
            self.oom_reported = true;
        }
        BufferError::OutOfMemory {
            requested,
            capacity: self.capacity,
        }
    }

    /// Drop the dead front, moving live bytes to the start of the region.
    fn compact(&mut self) {
        if self.deadfront > 0 {
            self.data.drain(..self.deadfront);
            self.deadfront = 0;
        }
    }

    /// Length of the leading record, if any.
    pub fn next_record_len(&self) -> BufferResult<Option<usize>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.framing
            .record_len(&self.data[self.deadfront..])
            .map(Some)
            .map_err(|e| relocate(e, self.deadfront))
    }

    /// Write as many whole records as fit within `limit` bytes to `sink`.
    ///
    /// A leading record that was partly written by an earlier call is always
    /// finished, whatever the limit. `sink` is expected to be non-blocking:
    /// `WouldBlock` counts as zero bytes sent. Returns the number of bytes
    /// written by this call.
    pub fn transmitted_bytes<W>(&mut self, sink: &mut W, limit: usize) -> BufferResult<usize>
    where
        W: Write + ?Sized,
    {
        let offset = self.partial_front;
        let live = &self.data[self.deadfront..];

        let mut ends = Vec::new();
        let mut selected = 0;
        let mut stalled = None;

        while selected < live.len() {
            let len = match self.framing.record_len(&live[selected..]) {
                Ok(len) => len,
                Err(e) => {
                    stalled = Some(relocate(e, self.deadfront + selected));
                    break;
                }
            };

            let finishing_partial = selected == 0 && offset > 0;
            if selected + len > limit && !finishing_partial {
                break;
            }
            selected += len;
            ends.push(selected);
        }

        if selected == 0 {
            return match stalled {
                Some(e) => {
                    if !self.decode_reported {
                        warn!(error = %e, "Failed to decode buffered record, holding backlog");
                        self.decode_reported = true;
                    }
                    Err(e)
                }
                None => Ok(0),
            };
        }

        let sent = match sink.write(&live[offset..selected]) {
            Ok(0) => {
                return Err(BufferError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                )))
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(0)
            }
            Err(e) => return Err(e.into()),
        };

        let on_wire = offset + sent;
        let complete = ends
            .iter()
            .take_while(|&&end| end <= on_wire)
            .last()
            .copied()
            .unwrap_or(0);

        self.deadfront += complete;
        self.partial_front = on_wire - complete;
        self.decode_reported = false;

        if let Some(e) = stalled {
            if on_wire == selected {
                debug!(error = %e, "Stopped flushing at undecodable record");
            }
        }

        if complete > 0 {
            self.maybe_shrink();
        }

        Ok(sent)
    }

    /// Give memory back once the backlog has mostly drained.
    fn maybe_shrink(&mut self) {
        let live = self.buffered();
        let increment = self.config.alloc_increment.max(1);

        if live < self.capacity / 2 && self.capacity > SHRINK_INCREMENTS * increment {
            let resize = (live / increment + 1) * increment;
            self.compact();
            self.data.shrink_to(resize);
            info!(
                old_capacity = self.capacity,
                new_capacity = resize,
                buffered = live,
                "Shrunk export buffer"
            );
            self.capacity = resize;
            self.oom_reported = false;
        } else if self.capacity - self.data.len() < self.capacity / 4
            && self.deadfront >= self.capacity / 4
        {
            self.compact();
        }
    }

    /// Forget how much of the leading record was sent.
    ///
    /// Used after reconnecting: the mediator discarded the torn record along
    /// with the old connection, so it has to go out again in full.
    pub fn rewind_partial(&mut self) {
        self.partial_front = 0;
    }

    /// Drop every buffered byte and release the allocation.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
        self.deadfront = 0;
        self.partial_front = 0;
    }
}

impl fmt::Debug for ExportBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportBuffer")
            .field("framing", &self.framing)
            .field("buffered", &self.buffered())
            .field("capacity", &self.capacity)
            .field("deadfront", &self.deadfront)
            .field("partial_front", &self.partial_front)
            .finish()
    }
}

fn relocate(err: BufferError, base: usize) -> BufferError {
    match err {
        BufferError::Decode { offset, reason } => BufferError::Decode {
            offset: base + offset,
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayHeader;

    /// Socket stand-in that accepts at most `chunk` bytes per write.
    struct ChunkedSink {
        accepted: Vec<u8>,
        chunk: usize,
        blocked: bool,
        broken: bool,
    }

    impl ChunkedSink {
        fn new(chunk: usize) -> Self {
            Self {
                accepted: Vec::new(),
                chunk,
                blocked: false,
                broken: false,
            }
        }
    }

    impl Write for ChunkedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A BER record of exactly `total` bytes.
    fn ber_record(total: usize, fill: u8) -> Vec<u8> {
        let mut out = vec![0x30];
        if total - 2 < 0x80 {
            out.push((total - 2) as u8);
        } else if total - 3 <= 0xff {
            out.extend_from_slice(&[0x81, (total - 3) as u8]);
        } else {
            let content = total - 4;
            out.extend_from_slice(&[0x82, (content >> 8) as u8, content as u8]);
        }
        out.resize(total, fill);
        out
    }

    fn plain(total: usize, fill: u8) -> ExportRecord {
        ExportRecord::new(1, ber_record(total, fill))
    }

    fn small_config(increment: usize) -> BufferConfig {
        BufferConfig {
            alloc_increment: increment,
            warning_threshold: usize::MAX,
            max_capacity: None,
        }
    }

    fn self_describing(increment: usize) -> ExportBuffer {
        ExportBuffer::new(Framing::SelfDescribing, small_config(increment))
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = ExportBuffer::new(Framing::RelayHeader, BufferConfig::default());
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.next_record_len().unwrap(), None);
    }

    #[test]
    fn test_record_larger_than_limit_is_not_split() {
        let mut buf = self_describing(1024);
        assert_eq!(buf.append(&plain(12, 1), 0).unwrap(), 12);

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 5).unwrap(), 0);
        assert!(sink.accepted.is_empty());
        assert_eq!(buf.buffered(), 12);

        assert_eq!(buf.transmitted_bytes(&mut sink, 12).unwrap(), 12);
        assert!(buf.is_empty());
        assert_eq!(sink.accepted, ber_record(12, 1));
    }

    #[test]
    fn test_limit_stops_at_record_boundary() {
        let mut buf = self_describing(1024);
        buf.append(&plain(100, 1), 0).unwrap();
        buf.append(&plain(200, 2), 0).unwrap();

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 150).unwrap(), 100);
        assert_eq!(sink.accepted, ber_record(100, 1));
        assert_eq!(buf.buffered(), 200);
        assert_eq!(buf.partial_front(), 0);

        assert_eq!(buf.transmitted_bytes(&mut sink, 150).unwrap(), 0);
        assert_eq!(buf.transmitted_bytes(&mut sink, 200).unwrap(), 200);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_writes_resume_at_first_unsent_byte() {
        let mut buf = self_describing(1024);
        let mut expected = Vec::new();
        for (i, size) in [40usize, 13, 90].iter().enumerate() {
            let record = plain(*size, i as u8);
            expected.extend_from_slice(&record.body);
            buf.append(&record, 0).unwrap();
        }

        let mut sink = ChunkedSink::new(7);
        let mut calls = 0;
        while !buf.is_empty() {
            let sent = buf.transmitted_bytes(&mut sink, 1000).unwrap();
            assert!(sent <= 7);
            assert!(buf.partial_front() < buf.next_record_len().unwrap().unwrap_or(1));
            calls += 1;
            assert!(calls < 100);
        }

        assert_eq!(sink.accepted, expected);
    }

    #[test]
    fn test_partial_record_finished_despite_small_limit() {
        let mut buf = self_describing(1024);
        buf.append(&plain(50, 1), 0).unwrap();
        buf.append(&plain(50, 2), 0).unwrap();

        let mut sink = ChunkedSink::new(30);
        assert_eq!(buf.transmitted_bytes(&mut sink, 100).unwrap(), 30);
        assert_eq!(buf.partial_front(), 30);

        // Limit below the remaining record still completes it
        sink.chunk = usize::MAX;
        assert_eq!(buf.transmitted_bytes(&mut sink, 10).unwrap(), 20);
        assert_eq!(buf.partial_front(), 0);
        assert_eq!(buf.buffered(), 50);
    }

    #[test]
    fn test_short_write_spanning_records_advances_dead_front() {
        let mut buf = self_describing(1024);
        buf.append(&plain(10, 1), 0).unwrap();
        buf.append(&plain(10, 2), 0).unwrap();
        buf.append(&plain(10, 3), 0).unwrap();

        let mut sink = ChunkedSink::new(25);
        assert_eq!(buf.transmitted_bytes(&mut sink, 30).unwrap(), 25);
        assert_eq!(buf.dead_front(), 20);
        assert_eq!(buf.partial_front(), 5);
        assert_eq!(buf.pending(), &ber_record(10, 3)[5..]);
    }

    #[test]
    fn test_would_block_sends_nothing() {
        let mut buf = self_describing(1024);
        buf.append(&plain(20, 1), 0).unwrap();

        let mut sink = ChunkedSink::new(usize::MAX);
        sink.blocked = true;
        assert_eq!(buf.transmitted_bytes(&mut sink, 100).unwrap(), 0);
        assert_eq!(buf.buffered(), 20);
        assert_eq!(buf.partial_front(), 0);
    }

    #[test]
    fn test_socket_error_reported_and_data_kept() {
        let mut buf = self_describing(1024);
        buf.append(&plain(20, 1), 0).unwrap();

        let mut sink = ChunkedSink::new(usize::MAX);
        sink.broken = true;
        assert!(matches!(
            buf.transmitted_bytes(&mut sink, 100),
            Err(BufferError::Io(_))
        ));
        assert_eq!(buf.pending(), ber_record(20, 1).as_slice());
    }

    #[test]
    fn test_already_sent_hint_applies_to_empty_buffer() {
        let mut buf = self_describing(1024);
        let record = plain(30, 9);
        buf.append(&record, 12).unwrap();
        assert_eq!(buf.partial_front(), 12);
        assert_eq!(buf.pending(), &record.body[12..]);

        // Hint is ignored once the buffer holds live bytes
        buf.append(&plain(10, 1), 4).unwrap();
        assert_eq!(buf.partial_front(), 12);

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 1000).unwrap(), 18 + 10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fully_sent_record_is_not_stored() {
        let mut buf = self_describing(1024);
        assert_eq!(buf.append(&plain(30, 9), 30).unwrap(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_growth_preserves_existing_bytes() {
        let mut buf = self_describing(64);
        let first = plain(50, 1);
        buf.append(&first, 0).unwrap();
        assert_eq!(buf.capacity(), 64);

        let second = plain(100, 2);
        buf.append(&second, 0).unwrap();
        assert_eq!(buf.capacity(), 192);
        assert_eq!(&buf.pending()[..50], first.body.as_slice());
        assert_eq!(&buf.pending()[50..], second.body.as_slice());
    }

    #[test]
    fn test_compaction_avoids_growth() {
        let mut buf = self_describing(100);
        buf.append(&plain(40, 1), 0).unwrap();
        buf.append(&plain(20, 2), 0).unwrap();

        let mut sink = ChunkedSink::new(usize::MAX);
        buf.transmitted_bytes(&mut sink, 40).unwrap();
        assert_eq!(buf.dead_front(), 40);

        // 20 live + 50 new fits in 100 once the dead front is dropped
        buf.append(&plain(50, 3), 0).unwrap();
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.dead_front(), 0);
        assert_eq!(buf.buffered(), 70);
    }

    #[test]
    fn test_capacity_cap_leaves_buffer_unchanged() {
        let mut buf = ExportBuffer::new(
            Framing::SelfDescribing,
            BufferConfig {
                alloc_increment: 64,
                warning_threshold: usize::MAX,
                max_capacity: Some(128),
            },
        );
        buf.append(&plain(100, 1), 0).unwrap();
        let before = buf.pending().to_vec();

        let err = buf.append(&plain(60, 2), 0).unwrap_err();
        assert!(matches!(err, BufferError::OutOfMemory { .. }));
        assert_eq!(buf.pending(), before.as_slice());
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.buffered(), 100);
    }

    /// Log sink shared with a scoped subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn count(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .matches(needle)
                .count()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_warning_threshold_logs_once_on_crossing() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut buf = ExportBuffer::new(
                Framing::SelfDescribing,
                BufferConfig {
                    alloc_increment: 64,
                    warning_threshold: 200,
                    max_capacity: None,
                },
            );

            // 64, 128, 192: still below the threshold
            for i in 0..3 {
                buf.append(&plain(60, i), 0).unwrap();
            }
            assert_eq!(buf.capacity(), 192);
            assert_eq!(logs.count("exceeded warning threshold"), 0);

            // 256 crosses it, later growth stays above it
            for i in 3..8 {
                buf.append(&plain(60, i), 0).unwrap();
            }
            assert_eq!(buf.capacity(), 512);
        });

        assert_eq!(logs.count("exceeded warning threshold"), 1);
    }

    #[test]
    fn test_relay_framing_requires_header() {
        let mut buf = ExportBuffer::new(Framing::RelayHeader, small_config(64));
        let err = buf.append(&ExportRecord::new(7, vec![1, 2, 3]), 0).unwrap_err();
        assert!(matches!(err, BufferError::MissingHeader(7)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_relay_framing_flushes_by_header_length() {
        let mut buf = ExportBuffer::new(Framing::RelayHeader, small_config(256));
        let a = ExportRecord::new(1, vec![1; 10])
            .with_header(RelayHeader::new(1, 1))
            .with_liid("A");
        let b = ExportRecord::new(1, vec![2; 10])
            .with_header(RelayHeader::new(1, 2))
            .with_trailer(vec![3; 5]);
        buf.append(&a, 0).unwrap();
        buf.append(&b, 0).unwrap();

        assert_eq!(buf.next_record_len().unwrap(), Some(a.wire_len()));

        let mut sink = ChunkedSink::new(usize::MAX);
        let limit = a.wire_len() + b.wire_len() - 1;
        assert_eq!(buf.transmitted_bytes(&mut sink, limit).unwrap(), a.wire_len());
        assert_eq!(buf.transmitted_bytes(&mut sink, 1000).unwrap(), b.wire_len());

        let mut expected = a.to_wire().unwrap();
        expected.extend(b.to_wire().unwrap());
        assert_eq!(sink.accepted, expected);
    }

    #[test]
    fn test_shrink_after_large_backlog_drains() {
        let mut buf = self_describing(64);
        for i in 0..12 {
            buf.append(&plain(60, i), 0).unwrap();
        }
        assert_eq!(buf.capacity(), 768);

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 600).unwrap(), 600);

        // 120 live bytes: reallocated to two increments, dead front dropped
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.dead_front(), 0);
        let mut expected = ber_record(60, 10);
        expected.extend(ber_record(60, 11));
        assert_eq!(buf.pending(), expected.as_slice());
    }

    #[test]
    fn test_in_place_compaction_when_tail_is_full() {
        let mut buf = self_describing(100);
        for i in 0..4 {
            buf.append(&plain(20, i), 0).unwrap();
        }
        buf.append(&plain(10, 9), 0).unwrap();
        assert_eq!(buf.capacity(), 100);

        // 40 sent: free tail 10 < 25 and dead front 40 >= 25
        let mut sink = ChunkedSink::new(usize::MAX);
        buf.transmitted_bytes(&mut sink, 40).unwrap();
        assert_eq!(buf.dead_front(), 0);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.buffered(), 50);
    }

    #[test]
    fn test_decode_failure_at_front_holds_backlog() {
        let mut buf = self_describing(64);
        buf.append(&plain(10, 1), 0).unwrap();
        // Smuggle in a malformed record behind a good one
        buf.data.extend_from_slice(&[0x30, 0x80, 0x00, 0x00]);

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 1000).unwrap(), 10);
        assert_eq!(buf.buffered(), 4);

        let err = buf.transmitted_bytes(&mut sink, 1000).unwrap_err();
        assert!(matches!(err, BufferError::Decode { .. }));
        assert_eq!(buf.buffered(), 4);
        assert_eq!(sink.accepted.len(), 10);
    }

    #[test]
    fn test_self_describing_rejects_records_that_misframe() {
        let mut buf = self_describing(64);
        let liid = ExportRecord::new(1, vec![0x30, 0x03, 9, 9, 9]).with_liid("AB");
        assert!(matches!(
            buf.append(&liid, 0),
            Err(BufferError::Decode { .. })
        ));
        let loose = ExportRecord::new(1, vec![0x30, 0x02, 9, 9])
            .with_trailer(vec![0x45, 0x00, 0x00, 0x54]);
        assert!(matches!(
            buf.append(&loose, 0),
            Err(BufferError::Decode { .. })
        ));
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);

        // Trailer inside the outer length frames as one record
        let covered = ExportRecord::new(1, vec![0x30, 0x06, 9, 9])
            .with_trailer(vec![0x45, 0x00, 0x00, 0x54]);
        buf.append(&covered, 3).unwrap();
        buf.append(&plain(10, 1), 0).unwrap();

        let mut sink = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut sink, 1).unwrap(), 5);
        assert_eq!(sink.accepted, vec![9, 0x45, 0x00, 0x00, 0x54]);
        assert_eq!(buf.next_record_len().unwrap(), Some(10));
    }

    #[test]
    fn test_rewind_partial_resends_leading_record() {
        let mut buf = self_describing(64);
        buf.append(&plain(20, 1), 0).unwrap();

        let mut sink = ChunkedSink::new(8);
        buf.transmitted_bytes(&mut sink, 100).unwrap();
        assert_eq!(buf.partial_front(), 8);

        buf.rewind_partial();
        let mut fresh = ChunkedSink::new(usize::MAX);
        assert_eq!(buf.transmitted_bytes(&mut fresh, 100).unwrap(), 20);
        assert_eq!(fresh.accepted, ber_record(20, 1));
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut buf = self_describing(64);
        buf.append(&plain(20, 1), 5).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.partial_front(), 0);
    }
}
