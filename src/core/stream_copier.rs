//! # Stream Copier
//!
//! Copies exactly `length` bytes from one async stream to another.
//!
//! Bytes already buffered by the reader (the part of a bulk body that arrived
//! together with its header) are written first. Neither stream is closed
//! afterwards; the output is flushed once the last byte is written. Running out
//! of input before `length` bytes is an error.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::config::BULK_COPY_BUFFER_SIZE;
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::Timer;

#[derive(Debug, Clone)]
pub struct StreamCopier {
    length: u64,
    prefix: Bytes,
    buffer_size: usize,
}

impl StreamCopier {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            prefix: Bytes::new(),
            buffer_size: BULK_COPY_BUFFER_SIZE,
        }
    }

    /// Bytes to emit before reading from the input. Anything past `length` is ignored.
    pub fn with_prefix(mut self, prefix: Bytes) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Run the copy. Returns the number of bytes copied, which is always `length`.
    pub async fn copy<R, W>(self, input: &mut R, output: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let _timer = Timer::start("bulk_copy");
        let mut copied: u64 = 0;

        if !self.prefix.is_empty() {
            let take = usize::try_from(self.length)
                .map(|length| length.min(self.prefix.len()))
                .unwrap_or(self.prefix.len());
            output.write_all(&self.prefix[..take]).await?;
            copied += take as u64;
        }

        let chunk = usize::try_from(self.length - copied)
            .map(|left| left.min(self.buffer_size))
            .unwrap_or(self.buffer_size);
        let mut buffer = vec![0u8; chunk];

        while copied < self.length {
            let wanted = usize::try_from(self.length - copied)
                .map(|left| left.min(buffer.len()))
                .unwrap_or(buffer.len());
            let read = input.read(&mut buffer[..wanted]).await?;
            if read == 0 {
                return Err(ProtocolError::BulkShortInput {
                    copied,
                    expected: self.length,
                });
            }
            output.write_all(&buffer[..read]).await?;
            copied += read as u64;
            trace!(copied, remaining = self.length - copied, "Copied bulk chunk");
        }

        output.flush().await?;
        Ok(copied)
    }
}

/// Copy exactly `length` bytes from `input` to `output`.
pub async fn copy_exact<R, W>(input: &mut R, output: &mut W, length: u64) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    StreamCopier::new(length).copy(input, output).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn copies_prefix_then_stream() {
        let mut input: &[u8] = b"cdefXYZ";
        let mut output = Vec::new();
        let copied = StreamCopier::new(6)
            .with_prefix(Bytes::from_static(b"ab"))
            .with_buffer_size(3)
            .copy(&mut input, &mut output)
            .await
            .unwrap();
        assert_eq!(copied, 6);
        assert_eq!(output, b"abcdef");
        assert_eq!(input, b"XYZ");
    }

    #[tokio::test]
    async fn short_input_is_an_error() {
        let mut input: &[u8] = b"abc";
        let mut output = Vec::new();
        let err = copy_exact(&mut input, &mut output, 5).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BulkShortInput {
                copied: 3,
                expected: 5
            }
        ));
    }

    #[tokio::test]
    async fn zero_length_copies_nothing() {
        let mut input: &[u8] = b"abc";
        let mut output = Vec::new();
        assert_eq!(copy_exact(&mut input, &mut output, 0).await.unwrap(), 0);
        assert!(output.is_empty());
        assert_eq!(input.len(), 3);
    }
}
