//! # Bulk Stream Handles
//!
//! A bulk body is never buffered by the transport. Instead the transport lends
//! its raw stream to whoever handles the packet, wrapped in a handle that
//! allows exactly one copy of exactly `length` bytes.
//!
//! When the copy finishes the stream goes back to the transport, which then
//! resumes reading or writing packets. Dropping a handle without copying (or
//! a failed copy) closes the transport, since the channel position is lost.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::core::packet::BulkHeader;
use crate::core::stream_copier::StreamCopier;
use crate::error::{constants, CloseReason, ProtocolError, Result};
use crate::transport::{BoxedReader, BoxedWriter};

/// How a lent stream comes back: the stream itself and whether the copy succeeded.
pub(crate) type Returned<S> = (S, std::result::Result<(), CloseReason>);

pub(crate) type ReturnSender<S> = oneshot::Sender<Returned<S>>;

/// A stream on loan from a transport.
struct StreamLease<S> {
    stream: Option<S>,
    done: Option<ReturnSender<S>>,
}

impl<S> StreamLease<S> {
    fn new(stream: S, done: ReturnSender<S>) -> Self {
        Self {
            stream: Some(stream),
            done: Some(done),
        }
    }

    fn take(&mut self) -> Result<S> {
        self.stream.take().ok_or(ProtocolError::BulkAbandoned)
    }

    fn finish(&mut self, stream: S, outcome: std::result::Result<(), CloseReason>) {
        if let Some(done) = self.done.take() {
            // The transport may already be gone; then nobody needs the stream back
            let _ = done.send((stream, outcome));
        }
    }
}

impl<S> Drop for StreamLease<S> {
    fn drop(&mut self) {
        if let (Some(done), Some(stream)) = (self.done.take(), self.stream.take()) {
            let reason = CloseReason::Bulk(constants::ERR_BULK_ABANDONED.to_string());
            let _ = done.send((stream, Err(reason)));
        }
    }
}

fn outcome_of(result: &Result<u64>) -> std::result::Result<(), CloseReason> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(CloseReason::from_error(e)),
    }
}

/// An incoming bulk packet whose body is still on the channel.
pub struct IncomingBulk {
    header: BulkHeader,
    prefix: Bytes,
    buffer_size: usize,
    lease: StreamLease<BoxedReader>,
}

impl IncomingBulk {
    /// `prefix` holds body bytes the transport had already buffered.
    pub(crate) fn new(
        header: BulkHeader,
        prefix: Bytes,
        reader: BoxedReader,
        done: ReturnSender<BoxedReader>,
        buffer_size: usize,
    ) -> Self {
        Self {
            header,
            prefix,
            buffer_size,
            lease: StreamLease::new(reader, done),
        }
    }

    pub fn header(&self) -> &BulkHeader {
        &self.header
    }

    pub fn actor(&self) -> &str {
        &self.header.actor
    }

    pub fn kind(&self) -> &str {
        &self.header.kind
    }

    pub fn length(&self) -> u64 {
        self.header.length
    }

    /// Copy the body into `output`, then return the stream to the transport.
    pub async fn copy_to<W>(mut self, output: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.lease.take()?;
        let result = StreamCopier::new(self.header.length)
            .with_prefix(std::mem::take(&mut self.prefix))
            .with_buffer_size(self.buffer_size)
            .copy(&mut reader, output)
            .await;
        self.lease.finish(reader, outcome_of(&result));
        result
    }

    /// Collect the whole body in memory.
    pub async fn read_to_vec(self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(usize::try_from(self.length()).unwrap_or(0).min(1 << 20));
        self.copy_to(&mut body).await?;
        Ok(body)
    }
}

impl fmt::Debug for IncomingBulk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingBulk")
            .field("header", &self.header)
            .field("buffered", &self.prefix.len())
            .finish()
    }
}

/// An outgoing bulk packet whose header has been written.
pub struct OutgoingBulk {
    header: BulkHeader,
    buffer_size: usize,
    lease: StreamLease<BoxedWriter>,
}

impl OutgoingBulk {
    pub(crate) fn new(
        header: BulkHeader,
        writer: BoxedWriter,
        done: ReturnSender<BoxedWriter>,
        buffer_size: usize,
    ) -> Self {
        Self {
            header,
            buffer_size,
            lease: StreamLease::new(writer, done),
        }
    }

    pub fn header(&self) -> &BulkHeader {
        &self.header
    }

    pub fn length(&self) -> u64 {
        self.header.length
    }

    /// Copy exactly `length` bytes from `input` onto the channel.
    pub async fn copy_from<R>(mut self, input: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.lease.take()?;
        let result = StreamCopier::new(self.header.length)
            .with_buffer_size(self.buffer_size)
            .copy(input, &mut writer)
            .await;
        self.lease.finish(writer, outcome_of(&result));
        result
    }

    /// Write a body held in memory. It must be exactly `length` bytes.
    pub async fn write_all(self, body: &[u8]) -> Result<()> {
        if body.len() as u64 > self.header.length {
            return Err(ProtocolError::Framing(format!(
                "bulk body is {} bytes but the header declared {}",
                body.len(),
                self.header.length
            )));
        }
        let mut input = body;
        self.copy_from(&mut input).await.map(|_| ())
    }
}

impl fmt::Debug for OutgoingBulk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingBulk")
            .field("header", &self.header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn stream_returns_after_copy() {
        let (tx, rx) = oneshot::channel();
        let reader: BoxedReader = Box::new(&b"world!"[..]);
        let bulk = IncomingBulk::new(
            BulkHeader::new("a.b", "t", 5),
            Bytes::from_static(b"he"),
            reader,
            tx,
            4,
        );
        let body = bulk.read_to_vec().await.unwrap();
        assert_eq!(body, b"hewor");
        let (_reader, outcome) = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn dropped_handle_reports_abandoned() {
        let (tx, rx) = oneshot::channel();
        let reader: BoxedReader = Box::new(&b""[..]);
        let bulk = IncomingBulk::new(BulkHeader::new("a.b", "t", 1), Bytes::new(), reader, tx, 4);
        drop(bulk);
        let (_reader, outcome) = rx.await.unwrap();
        assert!(matches!(outcome, Err(CloseReason::Bulk(_))));
    }

    #[tokio::test]
    async fn short_body_is_reported_to_transport() {
        let (tx, rx) = oneshot::channel();
        let writer: BoxedWriter = Box::new(Vec::new());
        let bulk = OutgoingBulk::new(BulkHeader::new("a.b", "t", 4), writer, tx, 4);
        assert!(bulk.write_all(b"ab").await.is_err());
        let (_writer, outcome) = rx.await.unwrap();
        assert!(matches!(outcome, Err(CloseReason::Bulk(_))));
    }
}
