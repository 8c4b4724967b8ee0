//! Wire framing for exported intercept records.
//!
//! Records reach the mediator in one of two framings.
//!
//! # Relay framing
//!
//! Used when the collector talks to the mediator over the internal relay
//! protocol. Every record starts with a fixed 16-byte header that carries
//! the length of everything after it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RelayHeader (16 bytes, big-endian)                           │
//! │  ├─ magic: u32        (0x5C4C6C5C)                           │
//! │  ├─ body_len: u16     (bytes following the header)           │
//! │  ├─ kind: u16         (record kind, opaque here)             │
//! │  └─ internal_id: u64  (intercept-internal identifier)        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ liid_len: u16 BE + liid bytes   (when the record has a LIID) │
//! │ encoded body                                                 │
//! │ trailer                         (e.g. captured IP content)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Self-describing framing
//!
//! Without the relay header the body is a single BER TLV, so the record
//! length is recovered from its identifier and length octets.

use serde::{Deserialize, Serialize};

use crate::error::{BufferError, BufferResult};

/// Magic number at the start of every relay header.
pub const RELAY_MAGIC: u32 = 0x5C4C_6C5C;

/// Size of the relay header in bytes.
pub const RELAY_HEADER_LEN: usize = 16;

/// Size of the LIID length prefix in bytes.
pub const LIID_PREFIX_LEN: usize = 2;

/// Largest body length a relay header can express.
pub const MAX_RELAY_BODY_LEN: usize = u16::MAX as usize;

/// Longest BER length field we accept (in octets, excluding the lead octet).
const MAX_BER_LENGTH_OCTETS: usize = 8;

/// How record boundaries are found in a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Each record is prefixed with a [`RelayHeader`].
    #[default]
    RelayHeader,
    /// Each record is a BER TLV and carries its own length.
    SelfDescribing,
}

impl Framing {
    /// Length of the record at the start of `buf`.
    ///
    /// Fails if the leading bytes do not describe a complete record.
    pub fn record_len(self, buf: &[u8]) -> BufferResult<usize> {
        let len = match self {
            Framing::RelayHeader => {
                let (_, body_len) = RelayHeader::decode(buf)?;
                RELAY_HEADER_LEN + body_len as usize
            }
            Framing::SelfDescribing => ber_pdu_length(buf)?,
        };

        if len > buf.len() {
            return Err(BufferError::decode(
                0,
                format!("record needs {} bytes, only {} available", len, buf.len()),
            ));
        }
        Ok(len)
    }
}

/// Fixed header used by the internal relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayHeader {
    /// Record kind (IRI, CC, keepalive, ...). Opaque to the exporter.
    pub kind: u16,
    /// Intercept-internal identifier.
    pub internal_id: u64,
}

impl RelayHeader {
    pub fn new(kind: u16, internal_id: u64) -> Self {
        Self { kind, internal_id }
    }

    /// Encode the header for a record whose post-header length is `body_len`.
    pub fn encode(&self, body_len: u16) -> [u8; RELAY_HEADER_LEN] {
        let mut out = [0u8; RELAY_HEADER_LEN];
        out[0..4].copy_from_slice(&RELAY_MAGIC.to_be_bytes());
        out[4..6].copy_from_slice(&body_len.to_be_bytes());
        out[6..8].copy_from_slice(&self.kind.to_be_bytes());
        out[8..16].copy_from_slice(&self.internal_id.to_be_bytes());
        out
    }

    /// Decode a header, returning it together with its body length.
    pub fn decode(buf: &[u8]) -> BufferResult<(Self, u16)> {
        if buf.len() < RELAY_HEADER_LEN {
            return Err(BufferError::decode(
                0,
                format!(
                    "relay header too short: {} bytes, need {}",
                    buf.len(),
                    RELAY_HEADER_LEN
                ),
            ));
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != RELAY_MAGIC {
            return Err(BufferError::decode(
                0,
                format!("bad relay magic {:#010x}", magic),
            ));
        }

        let body_len = u16::from_be_bytes([buf[4], buf[5]]);
        let kind = u16::from_be_bytes([buf[6], buf[7]]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);

        Ok((
            Self {
                kind,
                internal_id: u64::from_be_bytes(id),
            },
            body_len,
        ))
    }
}

/// Total length (identifier + length octets + contents) of the BER TLV at
/// the start of `buf`.
///
/// Only definite lengths are supported; ETSI records are always encoded
/// with definite lengths at the top level.
pub fn ber_pdu_length(buf: &[u8]) -> BufferResult<usize> {
    let mut pos = 0;

    let tag = *buf
        .first()
        .ok_or_else(|| BufferError::decode(0, "empty buffer"))?;
    pos += 1;

    // High-tag-number form: tag continues while bit 8 is set
    if tag & 0x1f == 0x1f {
        loop {
            let b = *buf
                .get(pos)
                .ok_or_else(|| BufferError::decode(pos, "truncated identifier octets"))?;
            pos += 1;
            if b & 0x80 == 0 {
                break;
            }
        }
    }

    let lead = *buf
        .get(pos)
        .ok_or_else(|| BufferError::decode(pos, "missing length octet"))?;
    pos += 1;

    let content_len = if lead & 0x80 == 0 {
        lead as usize
    } else {
        let count = (lead & 0x7f) as usize;
        if count == 0 {
            return Err(BufferError::decode(pos - 1, "indefinite length not supported"));
        }
        if count > MAX_BER_LENGTH_OCTETS {
            return Err(BufferError::decode(
                pos - 1,
                format!("length field of {} octets", count),
            ));
        }
        let octets = buf
            .get(pos..pos + count)
            .ok_or_else(|| BufferError::decode(pos, "truncated length octets"))?;
        pos += count;

        let len = octets.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        usize::try_from(len)
            .map_err(|_| BufferError::decode(pos - count, "length does not fit in memory"))?
    };

    pos.checked_add(content_len)
        .ok_or_else(|| BufferError::decode(0, "length overflow"))
}
