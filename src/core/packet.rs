//! # Packets
//!
//! Two packet kinds share one channel:
//!
//! ```text
//! JSON:  <decimal length>:<UTF-8 JSON of exactly that many bytes>
//! Bulk:  bulk <actor> <type> <decimal length>:<raw bytes of exactly that length>
//! ```
//!
//! Incoming packets are assembled incrementally from whatever the channel has
//! delivered so far. Outgoing packets are written segment by segment and
//! tolerate partial writes.
//!
//! The packet kind is chosen by peeking at the first four bytes: `bulk`
//! selects a [`BulkPacket`], anything else is the start of a JSON length field.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{TransportConfig, PACKET_TYPE_PEEK};
use crate::core::segment::{
    advance_first, next_chunk, DelimitedSegment, Segment, StreamSegment, StringSegment, WriteChunk,
};
use crate::error::{constants, ProtocolError, Result};

const BULK_KEYWORD: &[u8; PACKET_TYPE_PEEK] = b"bulk";

/// Header of a bulk packet: who it is for, what it is, how long the body is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHeader {
    pub actor: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub length: u64,
}

impl BulkHeader {
    pub fn new(actor: impl Into<String>, kind: impl Into<String>, length: u64) -> Self {
        Self {
            actor: actor.into(),
            kind: kind.into(),
            length,
        }
    }
}

/// Limits applied while assembling incoming packets.
#[derive(Debug, Clone, Copy)]
pub struct FramingLimits {
    pub max_delimiter_scan: usize,
    pub max_token_scan: usize,
    pub max_payload_size: usize,
}

impl From<&TransportConfig> for FramingLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_delimiter_scan: config.max_delimiter_scan,
            max_token_scan: config.max_token_scan,
            max_payload_size: config.max_payload_size,
        }
    }
}

impl Default for FramingLimits {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

fn parse_length(field: &[u8]) -> Result<u64> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Framing(format!(
            "{}: {:?}",
            constants::ERR_INVALID_LENGTH,
            String::from_utf8_lossy(field)
        )));
    }
    // All digits, so only overflow can fail here
    std::str::from_utf8(field)
        .ok()
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::Framing(constants::ERR_INVALID_LENGTH.to_string()))
}

fn token(segment: &DelimitedSegment) -> Result<String> {
    String::from_utf8(segment.data().to_vec())
        .map_err(|_| ProtocolError::Framing(constants::ERR_INVALID_UTF8.to_string()))
}

/// A length-prefixed JSON packet.
#[derive(Debug, Clone)]
pub struct JsonPacket {
    length: DelimitedSegment,
    data: StringSegment,
    declared: Option<usize>,
    max_payload_size: usize,
}

impl JsonPacket {
    /// Prepare an incoming packet. The length field is read from the buffer.
    pub fn incoming(limits: &FramingLimits) -> Self {
        Self {
            length: DelimitedSegment::new(b':', limits.max_delimiter_scan),
            data: StringSegment::with_length(0),
            declared: None,
            max_payload_size: limits.max_payload_size,
        }
    }

    /// Serialize `object` into an outgoing packet. The length counts UTF-8 bytes.
    pub fn from_object(object: &Value) -> Result<Self> {
        let body = serde_json::to_vec(object)?;
        Ok(Self {
            length: DelimitedSegment::for_write(b':', body.len().to_string().as_bytes()),
            declared: Some(body.len()),
            data: StringSegment::from_bytes(&body),
            max_payload_size: body.len(),
        })
    }

    /// Consume bytes from `src`. Returns the object once the body is complete.
    pub fn read(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        if self.declared.is_none() {
            self.length.read(src)?;
            if !self.length.is_done() {
                return Ok(None);
            }
            let declared = parse_length(self.length.data())?;
            let declared = usize::try_from(declared)
                .map_err(|_| ProtocolError::OversizedPacket(usize::MAX))?;
            if declared > self.max_payload_size {
                return Err(ProtocolError::OversizedPacket(declared));
            }
            self.declared = Some(declared);
            self.data = StringSegment::with_length(declared);
        }

        self.data.read(src);
        if !self.data.is_done() {
            return Ok(None);
        }

        let text = std::str::from_utf8(self.data.data())
            .map_err(|_| ProtocolError::Framing(constants::ERR_INVALID_UTF8.to_string()))?;
        let object = serde_json::from_str(text)?;
        Ok(Some(object))
    }

    /// Declared body length, once known.
    pub fn declared_length(&self) -> Option<usize> {
        self.declared
    }

    pub fn is_done(&self) -> bool {
        self.length.is_done() && self.data.is_done()
    }

    pub fn next_chunk(&self) -> Option<WriteChunk<'_>> {
        let segments: [&dyn Segment; 2] = [&self.length, &self.data];
        next_chunk(&segments)
    }

    pub fn advance(&mut self, written: usize) {
        let mut segments: [&mut dyn Segment; 2] = [&mut self.length, &mut self.data];
        advance_first(&mut segments, written);
    }
}

/// A bulk packet: a short text header followed by raw bytes.
///
/// The raw bytes are never held by the packet. Once the header is complete the
/// packet's stream segment is handed off and the consumer copies the body
/// straight from the channel.
#[derive(Debug, Clone)]
pub struct BulkPacket {
    keyword: DelimitedSegment,
    actor: DelimitedSegment,
    kind: DelimitedSegment,
    length: DelimitedSegment,
    stream: StreamSegment,
    header: Option<BulkHeader>,
}

impl BulkPacket {
    /// Prepare an incoming packet whose `bulk` keyword was already consumed
    /// by the type peek. Only the space after it remains.
    pub fn incoming(limits: &FramingLimits) -> Self {
        Self {
            keyword: DelimitedSegment::new(b' ', 1),
            actor: DelimitedSegment::new(b' ', limits.max_token_scan),
            kind: DelimitedSegment::new(b' ', limits.max_token_scan),
            length: DelimitedSegment::new(b':', limits.max_delimiter_scan),
            stream: StreamSegment::new(0),
            header: None,
        }
    }

    /// An outgoing packet for `header`.
    pub fn outgoing(header: &BulkHeader) -> Self {
        Self {
            keyword: DelimitedSegment::for_write(b' ', BULK_KEYWORD),
            actor: DelimitedSegment::for_write(b' ', header.actor.as_bytes()),
            kind: DelimitedSegment::for_write(b' ', header.kind.as_bytes()),
            length: DelimitedSegment::for_write(b':', header.length.to_string().as_bytes()),
            stream: StreamSegment::new(header.length),
            header: Some(header.clone()),
        }
    }

    /// Consume header bytes from `src`. Returns the header once it is complete,
    /// at which point the stream segment is handed off.
    pub fn read(&mut self, src: &mut BytesMut) -> Result<Option<BulkHeader>> {
        for segment in [
            &mut self.keyword,
            &mut self.actor,
            &mut self.kind,
            &mut self.length,
        ] {
            segment.read(src)?;
            if !segment.is_done() {
                return Ok(None);
            }
        }

        if !self.keyword.data().is_empty() {
            return Err(ProtocolError::Framing(
                "bulk keyword must be followed by a space".to_string(),
            ));
        }

        let header = BulkHeader {
            actor: token(&self.actor)?,
            kind: token(&self.kind)?,
            length: parse_length(self.length.data())?,
        };
        self.stream = StreamSegment::new(header.length);
        self.stream.activate()?;
        self.header = Some(header.clone());
        Ok(Some(header))
    }

    pub fn header(&self) -> Option<&BulkHeader> {
        self.header.as_ref()
    }

    /// The consumer (or producer) of the raw bytes is finished.
    pub fn complete_stream(&mut self) {
        self.stream.complete();
    }

    pub fn is_done(&self) -> bool {
        self.stream.is_done()
    }

    pub fn next_chunk(&self) -> Option<WriteChunk<'_>> {
        let segments: [&dyn Segment; 5] = [
            &self.keyword,
            &self.actor,
            &self.kind,
            &self.length,
            &self.stream,
        ];
        next_chunk(&segments)
    }

    pub fn advance(&mut self, written: usize) {
        let mut segments: [&mut dyn Segment; 5] = [
            &mut self.keyword,
            &mut self.actor,
            &mut self.kind,
            &mut self.length,
            &mut self.stream,
        ];
        advance_first(&mut segments, written);
    }
}

/// Either packet kind.
#[derive(Debug, Clone)]
pub enum Packet {
    Json(JsonPacket),
    Bulk(BulkPacket),
}

impl Packet {
    /// Choose the incoming packet kind from the start of `src`.
    ///
    /// `bulk` is consumed; a JSON length field is left in place for the JSON
    /// packet to read. Returns `None` while the buffer is still a prefix of
    /// `bulk`, since only then can the kind not be decided yet.
    pub fn from_type(src: &mut BytesMut, limits: &FramingLimits) -> Option<Self> {
        if src.is_empty() {
            return None;
        }
        if src.len() >= PACKET_TYPE_PEEK {
            if &src[..PACKET_TYPE_PEEK] == BULK_KEYWORD {
                src.advance(PACKET_TYPE_PEEK);
                return Some(Self::Bulk(BulkPacket::incoming(limits)));
            }
            return Some(Self::Json(JsonPacket::incoming(limits)));
        }
        if BULK_KEYWORD.starts_with(&src[..]) {
            None
        } else {
            Some(Self::Json(JsonPacket::incoming(limits)))
        }
    }

    pub fn next_chunk(&self) -> Option<WriteChunk<'_>> {
        match self {
            Self::Json(packet) => packet.next_chunk(),
            Self::Bulk(packet) => packet.next_chunk(),
        }
    }

    pub fn advance(&mut self, written: usize) {
        match self {
            Self::Json(packet) => packet.advance(written),
            Self::Bulk(packet) => packet.advance(written),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn drain(packet: &mut Packet) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(WriteChunk::Bytes(bytes)) = packet.next_chunk() {
            // one byte at a time, like a congested socket
            out.push(bytes[0]);
            packet.advance(1);
        }
        out
    }

    #[test]
    fn json_packet_length_counts_utf8_bytes() {
        let mut packet = Packet::Json(JsonPacket::from_object(&json!({"a": "é"})).unwrap());
        let wire = drain(&mut packet);
        assert_eq!(wire, "10:{\"a\":\"é\"}".as_bytes());
    }

    #[test]
    fn bulk_header_stops_before_stream() {
        let header = BulkHeader::new("conn0.a1", "image", 3);
        let mut packet = Packet::Bulk(BulkPacket::outgoing(&header));
        let wire = drain(&mut packet);
        assert_eq!(wire, b"bulk conn0.a1 image 3:");
        assert_eq!(packet.next_chunk(), Some(WriteChunk::HandOff(3)));
    }

    #[test]
    fn peek_defers_on_bulk_prefix() {
        let limits = FramingLimits::default();
        let mut src = BytesMut::from(&b"bu"[..]);
        assert!(Packet::from_type(&mut src, &limits).is_none());
        assert_eq!(src.len(), 2);

        let mut src = BytesMut::from(&b"1:0"[..]);
        assert!(matches!(
            Packet::from_type(&mut src, &limits),
            Some(Packet::Json(_))
        ));
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn non_digit_length_is_rejected() {
        let limits = FramingLimits::default();
        let mut packet = JsonPacket::incoming(&limits);
        let mut src = BytesMut::from(&b"1x:{}"[..]);
        assert!(matches!(
            packet.read(&mut src),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn declared_length_above_limit_is_rejected() {
        let limits = FramingLimits {
            max_payload_size: 8,
            ..FramingLimits::default()
        };
        let mut packet = JsonPacket::incoming(&limits);
        let mut src = BytesMut::from(&b"9:"[..]);
        assert!(matches!(
            packet.read(&mut src),
            Err(ProtocolError::OversizedPacket(9))
        ));
    }

    #[test]
    fn bulk_header_is_parsed() {
        let limits = FramingLimits::default();
        let mut src = BytesMut::from(&b"bulk conn0.a1 image 5:hello"[..]);
        let Some(Packet::Bulk(mut packet)) = Packet::from_type(&mut src, &limits) else {
            panic!("expected bulk packet");
        };
        let header = packet.read(&mut src).unwrap().unwrap();
        assert_eq!(header, BulkHeader::new("conn0.a1", "image", 5));
        assert_eq!(&src[..], b"hello");
        assert!(!packet.is_done());
    }
}
