//! Encoded intercept records ready for export.

use crate::error::{BufferError, BufferResult};
use crate::protocol::{
    ber_pdu_length, Framing, RelayHeader, LIID_PREFIX_LEN, MAX_RELAY_BODY_LEN, RELAY_HEADER_LEN,
};

/// Identifier of a mediator destination. Records are routed by it.
pub type DestinationId = u32;

/// An already-encoded intercept PDU.
///
/// The body is opaque: the exporter never looks inside it except to
/// recover record lengths when no relay header is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    /// Destination this record is routed to
    pub dest_id: DestinationId,
    /// Relay header, when the internal relay protocol is in use
    pub header: Option<RelayHeader>,
    /// Intercept identifier, sent with a 2-byte length prefix
    pub liid: Option<String>,
    /// Encoded record body
    pub body: Vec<u8>,
    /// Raw payload appended after the body (e.g. captured IP content)
    pub trailer: Option<Vec<u8>>,
}

impl ExportRecord {
    pub fn new(dest_id: DestinationId, body: Vec<u8>) -> Self {
        Self {
            dest_id,
            header: None,
            liid: None,
            body,
            trailer: None,
        }
    }

    pub fn with_header(mut self, header: RelayHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_liid(mut self, liid: impl Into<String>) -> Self {
        self.liid = Some(liid.into());
        self
    }

    pub fn with_trailer(mut self, trailer: Vec<u8>) -> Self {
        self.trailer = Some(trailer);
        self
    }

    /// Trailer bytes, empty when there is none.
    pub fn trailer(&self) -> &[u8] {
        self.trailer.as_deref().unwrap_or(&[])
    }

    /// Bytes written before the trailer: header, LIID and body.
    pub fn head_len(&self) -> usize {
        let header = if self.header.is_some() {
            RELAY_HEADER_LEN
        } else {
            0
        };
        let liid = self
            .liid
            .as_ref()
            .map_or(0, |l| LIID_PREFIX_LEN + l.len());
        header + liid + self.body.len()
    }

    /// Total number of bytes this record occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.head_len() + self.trailer().len()
    }

    /// Check that every length field fits its wire representation.
    pub fn validate(&self) -> BufferResult<()> {
        if let Some(liid) = &self.liid {
            if liid.len() > u16::MAX as usize {
                return Err(BufferError::RecordTooLarge {
                    field: "liid",
                    size: liid.len(),
                    max: u16::MAX as usize,
                });
            }
        }

        if self.header.is_some() {
            let body_len = self.wire_len() - RELAY_HEADER_LEN;
            if body_len > MAX_RELAY_BODY_LEN {
                return Err(BufferError::RecordTooLarge {
                    field: "relay body",
                    size: body_len,
                    max: MAX_RELAY_BODY_LEN,
                });
            }
        }

        Ok(())
    }

    /// Check that the encoded record frames as exactly one record under
    /// `framing`.
    ///
    /// Relay framing needs a header. Self-describing records must carry no
    /// LIID prefix and their BER length must cover body and trailer.
    pub fn validate_for(&self, framing: Framing) -> BufferResult<()> {
        self.validate()?;

        match framing {
            Framing::RelayHeader => {
                if self.header.is_none() {
                    return Err(BufferError::MissingHeader(self.dest_id));
                }
            }
            Framing::SelfDescribing => {
                if self.liid.is_some() {
                    return Err(BufferError::decode(
                        0,
                        "LIID prefix is not allowed on self-describing records",
                    ));
                }
                let expected = self.body.len() + self.trailer().len();
                let pdu_len = ber_pdu_length(&self.body)?;
                if pdu_len != expected {
                    return Err(BufferError::decode(
                        0,
                        format!(
                            "BER length {} does not match record length {}",
                            pdu_len, expected
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Append header, LIID and body to `out` in wire order.
    pub fn encode_head_into(&self, out: &mut Vec<u8>) -> BufferResult<()> {
        self.validate()?;

        if let Some(header) = &self.header {
            let body_len = (self.wire_len() - RELAY_HEADER_LEN) as u16;
            out.extend_from_slice(&header.encode(body_len));
        }

        if let Some(liid) = &self.liid {
            out.extend_from_slice(&(liid.len() as u16).to_be_bytes());
            out.extend_from_slice(liid.as_bytes());
        }

        out.extend_from_slice(&self.body);
        Ok(())
    }

    /// Append the complete wire form of the record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> BufferResult<()> {
        self.encode_head_into(out)?;
        out.extend_from_slice(self.trailer());
        Ok(())
    }

    /// Complete wire form of the record.
    pub fn to_wire(&self) -> BufferResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}
