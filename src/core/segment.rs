//! # Packet Segments
//!
//! A packet on the wire is a sequence of segments. Each segment knows how to
//! consume its own bytes from an incoming buffer and how to hand its bytes to
//! an outgoing writer, a few at a time.
//!
//! - [`StringSegment`]: a fixed number of bytes (the JSON body)
//! - [`DelimitedSegment`]: bytes up to a one-byte delimiter (length fields, bulk tokens)
//! - [`StreamSegment`]: a placeholder for raw bytes handed off to a stream consumer

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};

/// The next thing an outgoing segment needs from the writer.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteChunk<'a> {
    /// These bytes still have to be written.
    Bytes(&'a [u8]),
    /// The writer must hand its stream to a bulk producer for this many bytes.
    HandOff(u64),
}

/// Shared behaviour of every segment kind.
pub trait Segment {
    /// Whether the segment has been fully read or fully written.
    fn is_done(&self) -> bool;

    /// What the writer should do next for this segment.
    fn write_chunk(&self) -> WriteChunk<'_>;

    /// Record that `written` bytes of the current chunk reached the channel.
    fn advance(&mut self, written: usize);
}

/// A run of exactly `length` bytes.
#[derive(Debug, Clone)]
pub struct StringSegment {
    data: BytesMut,
    length: usize,
    written: usize,
    outgoing: bool,
}

impl StringSegment {
    /// An incoming segment expecting `length` bytes.
    pub fn with_length(length: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(length),
            length,
            written: 0,
            outgoing: false,
        }
    }

    /// An outgoing segment holding `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            length: data.len(),
            written: 0,
            outgoing: true,
        }
    }

    /// Move as many bytes as still missing from `src` into the segment.
    pub fn read(&mut self, src: &mut BytesMut) {
        let wanted = self.length - self.data.len();
        let take = wanted.min(src.len());
        if take > 0 {
            self.data.extend_from_slice(&src.split_to(take));
        }
    }

    /// Bytes collected so far, or the bytes to send.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Segment for StringSegment {
    fn is_done(&self) -> bool {
        if self.outgoing {
            self.written == self.length
        } else {
            self.data.len() == self.length
        }
    }

    fn write_chunk(&self) -> WriteChunk<'_> {
        WriteChunk::Bytes(&self.data[self.written..])
    }

    fn advance(&mut self, written: usize) {
        self.written = (self.written + written).min(self.length);
    }
}

/// Bytes up to (and excluding) a one-byte delimiter.
///
/// Reading scans one byte at a time and gives up once `limit` bytes have been
/// consumed without finding the delimiter. A limit of 0 scans forever.
#[derive(Debug, Clone)]
pub struct DelimitedSegment {
    delimiter: u8,
    limit: usize,
    data: Vec<u8>,
    scanned: usize,
    found: bool,
    encoded: Vec<u8>,
    written: usize,
}

impl DelimitedSegment {
    /// An incoming segment with a scan limit.
    pub fn new(delimiter: u8, limit: usize) -> Self {
        Self {
            delimiter,
            limit,
            data: Vec::new(),
            scanned: 0,
            found: false,
            encoded: Vec::new(),
            written: 0,
        }
    }

    /// An outgoing segment: `token` followed by the delimiter.
    pub fn for_write(delimiter: u8, token: &[u8]) -> Self {
        let mut encoded = Vec::with_capacity(token.len() + 1);
        encoded.extend_from_slice(token);
        encoded.push(delimiter);
        Self {
            delimiter,
            limit: 0,
            data: token.to_vec(),
            scanned: encoded.len(),
            found: true,
            encoded,
            written: 0,
        }
    }

    /// Absorb bytes that were consumed before this segment took over, as when
    /// a type peek had to look past the start of the field.
    pub fn read_initial(&mut self, initial: &[u8]) -> Result<usize> {
        let mut src = BytesMut::from(initial);
        self.read(&mut src)?;
        Ok(initial.len() - src.len())
    }

    /// Consume bytes from `src` until the delimiter is found, the buffer runs
    /// out, or the scan limit is hit.
    pub fn read(&mut self, src: &mut BytesMut) -> Result<()> {
        while !self.found {
            if self.limit > 0 && self.scanned >= self.limit {
                return Err(ProtocolError::DelimiterLimit {
                    delimiter: char::from(self.delimiter),
                    limit: self.limit,
                });
            }
            if !src.has_remaining() {
                break;
            }
            let byte = src.get_u8();
            self.scanned += 1;
            if byte == self.delimiter {
                self.found = true;
            } else {
                self.data.push(byte);
            }
        }
        Ok(())
    }

    /// The token without its delimiter.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl Segment for DelimitedSegment {
    fn is_done(&self) -> bool {
        if self.encoded.is_empty() {
            self.found
        } else {
            self.written == self.encoded.len()
        }
    }

    fn write_chunk(&self) -> WriteChunk<'_> {
        WriteChunk::Bytes(&self.encoded[self.written..])
    }

    fn advance(&mut self, written: usize) {
        self.written = (self.written + written).min(self.encoded.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Waiting,
    HandedOff,
    Done,
}

/// Raw bytes that are never buffered by the packet.
///
/// The segment hands the underlying stream to a consumer exactly once and
/// stays incomplete until the consumer reports back.
#[derive(Debug, Clone)]
pub struct StreamSegment {
    length: u64,
    state: StreamState,
}

impl StreamSegment {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            state: StreamState::Waiting,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Mark the stream as handed off. Fails if it already was.
    pub fn activate(&mut self) -> Result<()> {
        if self.state != StreamState::Waiting {
            return Err(ProtocolError::Framing(
                "stream segment handed off more than once".to_string(),
            ));
        }
        self.state = StreamState::HandedOff;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == StreamState::HandedOff
    }

    /// The consumer finished copying.
    pub fn complete(&mut self) {
        self.state = StreamState::Done;
    }
}

impl Segment for StreamSegment {
    fn is_done(&self) -> bool {
        self.state == StreamState::Done
    }

    fn write_chunk(&self) -> WriteChunk<'_> {
        WriteChunk::HandOff(self.length)
    }

    fn advance(&mut self, _written: usize) {}
}

/// The first unfinished segment's chunk, or `None` when all are done.
pub(crate) fn next_chunk<'a>(segments: &[&'a dyn Segment]) -> Option<WriteChunk<'a>> {
    segments
        .iter()
        .copied()
        .find(|segment| !segment.is_done())
        .map(|segment| segment.write_chunk())
}

/// Advance the first unfinished segment.
pub(crate) fn advance_first(segments: &mut [&mut dyn Segment], written: usize) {
    if let Some(segment) = segments.iter_mut().find(|segment| !segment.is_done()) {
        segment.advance(written);
    }
}
