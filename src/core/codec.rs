//! # Packet Codec
//!
//! [`tokio_util::codec`] framing for the debugging wire format.
//!
//! Decoding yields one [`Frame`] per packet. A bulk frame carries only the
//! header; the body bytes are left in the buffer (and on the channel) for the
//! caller to hand to a bulk consumer before decoding the next frame.
//!
//! Encoding writes whole JSON packets, or a bulk header whose body the caller
//! then writes itself.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{BulkHeader, BulkPacket, FramingLimits, JsonPacket, Packet};
use crate::core::segment::WriteChunk;
use crate::error::{constants, ProtocolError, Result};

/// One decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    Bulk(BulkHeader),
}

/// Incremental decoder and encoder for JSON and bulk packets.
#[derive(Debug, Default)]
pub struct PacketCodec {
    limits: FramingLimits,
    incoming: Option<Packet>,
}

impl PacketCodec {
    pub fn new(limits: FramingLimits) -> Self {
        Self {
            limits,
            incoming: None,
        }
    }

    /// Whether a packet has been started but not finished.
    pub fn in_progress(&self) -> bool {
        self.incoming.is_some()
    }

    fn write_packet(packet: &mut Packet, dst: &mut BytesMut) {
        while let Some(WriteChunk::Bytes(bytes)) = packet.next_chunk() {
            let written = bytes.len();
            dst.extend_from_slice(bytes);
            packet.advance(written);
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if self.incoming.is_none() {
            match Packet::from_type(src, &self.limits) {
                Some(packet) => self.incoming = Some(packet),
                None => return Ok(None),
            }
        }

        let frame = match self.incoming.as_mut() {
            Some(Packet::Json(packet)) => packet.read(src)?.map(Frame::Json),
            Some(Packet::Bulk(packet)) => packet.read(src)?.map(Frame::Bulk),
            None => None,
        };

        if frame.is_some() {
            self.incoming = None;
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && !self.in_progress() => Ok(None),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                constants::ERR_TRUNCATED_PACKET,
            ))),
        }
    }
}

impl Encoder<&Value> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Value, dst: &mut BytesMut) -> Result<()> {
        let mut packet = Packet::Json(JsonPacket::from_object(item)?);
        Self::write_packet(&mut packet, dst);
        Ok(())
    }
}

impl Encoder<Value> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&Value>>::encode(self, &item, dst)
    }
}

impl Encoder<&BulkHeader> for PacketCodec {
    type Error = ProtocolError;

    /// Writes the header only, up to and including the `:`.
    fn encode(&mut self, item: &BulkHeader, dst: &mut BytesMut) -> Result<()> {
        let mut packet = Packet::Bulk(BulkPacket::outgoing(item));
        Self::write_packet(&mut packet, dst);
        Ok(())
    }
}
