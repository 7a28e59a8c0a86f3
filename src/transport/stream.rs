//! # Stream Transport
//!
//! [`DebuggerTransport`] frames packets over any async byte stream: a TCP
//! socket, a Unix socket, a pipe, or an in-memory duplex.
//!
//! ## Tasks
//! `ready()` spawns two tasks:
//! - the **reader** fills a buffer, decodes frames with [`PacketCodec`], and
//!   delivers them to the hooks in arrival order
//! - the **writer** drains the outgoing FIFO, writing each packet completely
//!   (across as many partial writes as the channel needs) before the next
//!
//! Bulk bodies are never buffered. The reader lends its half of the stream to
//! the bulk consumer and waits for it back; the writer does the same with the
//! bulk producer. Nothing else is read or written in the meantime.
//!
//! ## Failure
//! Any channel or framing error closes the transport: the in-flight packet is
//! dropped, the outgoing queue is discarded, and `on_closed` fires once.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::core::codec::{Frame, PacketCodec};
use crate::core::packet::{BulkHeader, BulkPacket, FramingLimits, JsonPacket, Packet};
use crate::core::segment::WriteChunk;
use crate::error::{constants, CloseReason, ProtocolError, Result};
use crate::transport::{
    BoxedReader, BoxedWriter, HookSlot, IncomingBulk, OutgoingBulk, PacketHooks, Transport,
};
use crate::utils::metrics::Metrics;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(0);

enum Outgoing {
    Json(Packet),
    Bulk {
        packet: Packet,
        header: BulkHeader,
        ready: oneshot::Sender<Result<OutgoingBulk>>,
    },
}

struct Halves {
    reader: BoxedReader,
    writer: BoxedWriter,
    queue: mpsc::UnboundedReceiver<Outgoing>,
}

struct Inner {
    name: String,
    config: TransportConfig,
    hooks: HookSlot,
    queue: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    halves: Mutex<Option<Halves>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

/// Packet transport over an async byte stream.
#[derive(Clone)]
pub struct DebuggerTransport {
    inner: Arc<Inner>,
}

impl DebuggerTransport {
    /// Wrap a reader and writer with default settings.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(
            reader,
            writer,
            &TransportConfig::default(),
            Arc::new(Metrics::new()),
        )
    }

    /// Wrap a single duplex stream with default settings.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    pub fn with_config<R, W>(
        reader: R,
        writer: W,
        config: &TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                name: format!("transport-{id}"),
                config: config.clone(),
                hooks: HookSlot::default(),
                queue: Mutex::new(Some(tx)),
                halves: Mutex::new(Some(Halves {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    queue: rx,
                })),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Transport for DebuggerTransport {
    #[instrument(skip(self), fields(transport = %self.inner.name))]
    fn ready(&self) -> Result<()> {
        let halves = self
            .inner
            .halves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Halves {
            reader,
            writer,
            queue,
        }) = halves
        else {
            if self.is_closed() {
                return Err(ProtocolError::Closed(CloseReason::StreamClosed));
            }
            return Ok(());
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no Tokio runtime: {e}")))?;
        runtime.spawn(read_loop(self.inner.clone(), reader));
        runtime.spawn(write_loop(self.inner.clone(), writer, queue));

        self.inner.metrics.transport_opened();
        info!("Transport ready");
        Ok(())
    }

    fn send(&self, packet: Value) -> Result<()> {
        if self.inner.config.log_packets {
            debug!(transport = %self.inner.name, %packet, "Sending packet");
        }
        let packet = JsonPacket::from_object(&packet)?;
        self.inner.enqueue(Outgoing::Json(Packet::Json(packet)))
    }

    fn start_bulk_send(&self, header: BulkHeader) -> BoxFuture<'static, Result<OutgoingBulk>> {
        let (ready, handle) = oneshot::channel();
        let queued = self.inner.enqueue(Outgoing::Bulk {
            packet: Packet::Bulk(BulkPacket::outgoing(&header)),
            header,
            ready,
        });
        async move {
            queued?;
            handle
                .await
                .map_err(|_| ProtocolError::Closed(CloseReason::StreamClosed))?
        }
        .boxed()
    }

    fn close(&self, reason: CloseReason) {
        self.inner.close(reason);
    }

    fn hooks(&self) -> Option<Arc<dyn PacketHooks>> {
        self.inner.hooks.get()
    }

    fn set_hooks(&self, hooks: Option<Arc<dyn PacketHooks>>) {
        self.inner.hooks.set(hooks);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DebuggerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerTransport")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn enqueue(&self, outgoing: Outgoing) -> Result<()> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(tx) => tx
                .send(outgoing)
                .map_err(|_| ProtocolError::Closed(CloseReason::StreamClosed)),
            None => Err(ProtocolError::Closed(CloseReason::StreamClosed)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        // Dropping the sender and any unstarted halves discards queued packets
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.halves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.metrics.transport_closed();
        info!(transport = %self.name, %reason, "Transport closed");

        if let Some(hooks) = self.hooks.take() {
            hooks.on_closed(&reason);
        }
    }

    fn deliver(&self, packet: Value) {
        if self.config.log_packets {
            debug!(transport = %self.name, %packet, "Received packet");
        }
        self.metrics.packet_received();
        match self.hooks.get() {
            Some(hooks) => hooks.on_packet(Arc::new(packet)),
            None => warn!(transport = %self.name, "No hooks installed, dropping packet"),
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: BoxedReader) {
    let mut codec = PacketCodec::new(FramingLimits::from(&inner.config));
    let mut buffer = BytesMut::with_capacity(inner.config.read_buffer_capacity);

    loop {
        loop {
            let frame = match codec.decode(&mut buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    inner.metrics.framing_error();
                    warn!(transport = %inner.name, error = %e, "Failed to frame incoming packet");
                    inner.close(CloseReason::from_error(&e));
                    return;
                }
            };
            if inner.is_closed() {
                return;
            }

            match frame {
                Frame::Json(packet) => inner.deliver(packet),
                Frame::Bulk(header) => {
                    let buffered = usize::try_from(header.length)
                        .map(|length| length.min(buffer.len()))
                        .unwrap_or(buffer.len());
                    let prefix = buffer.split_to(buffered).freeze();
                    let (done, handback) = oneshot::channel();
                    debug!(transport = %inner.name, actor = %header.actor, kind = %header.kind, length = header.length, "Received bulk packet");
                    let bulk = IncomingBulk::new(
                        header,
                        prefix,
                        reader,
                        done,
                        inner.config.bulk_copy_buffer_size,
                    );
                    inner.metrics.bulk_packet_received();
                    match inner.hooks.get() {
                        Some(hooks) => hooks.on_bulk_packet(bulk),
                        None => drop(bulk),
                    }

                    let returned = tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        returned = handback => returned,
                    };
                    match returned {
                        Ok((stream, Ok(()))) => reader = stream,
                        Ok((_, Err(reason))) => {
                            inner.close(reason);
                            return;
                        }
                        Err(_) => {
                            inner.close(CloseReason::Bulk(
                                constants::ERR_BULK_ABANDONED.to_string(),
                            ));
                            return;
                        }
                    }
                }
            }
        }

        let read = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            read = reader.read_buf(&mut buffer) => read,
        };
        match read {
            Ok(0) => {
                if !buffer.is_empty() || codec.in_progress() {
                    debug!(transport = %inner.name, buffered = buffer.len(), "{}", constants::ERR_TRUNCATED_PACKET);
                }
                inner.close(CloseReason::StreamClosed);
                return;
            }
            Ok(n) => {
                trace!(transport = %inner.name, bytes = n, "Read from channel");
                inner.metrics.bytes_read(n as u64);
            }
            Err(e) => {
                inner.close(CloseReason::from_io(&e));
                return;
            }
        }
    }
}

async fn write_packet(writer: &mut BoxedWriter, packet: &mut Packet) -> Result<u64> {
    let mut total = 0u64;
    while let Some(WriteChunk::Bytes(bytes)) = packet.next_chunk() {
        let written = writer.write(bytes).await?;
        if written == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        packet.advance(written);
        total += written as u64;
    }
    writer.flush().await?;
    Ok(total)
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(outgoing) = next else { break };

        match outgoing {
            Outgoing::Json(mut packet) => {
                let written = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    written = write_packet(&mut writer, &mut packet) => written,
                };
                match written {
                    Ok(bytes) => inner.metrics.packet_sent(bytes),
                    Err(e) => {
                        inner.close(CloseReason::from_error(&e));
                        break;
                    }
                }
            }
            Outgoing::Bulk {
                mut packet,
                header,
                ready,
            } => {
                let written = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    written = write_packet(&mut writer, &mut packet) => written,
                };
                let header_bytes = match written {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        inner.close(CloseReason::from_error(&e));
                        break;
                    }
                };

                let length = header.length;
                let (done, handback) = oneshot::channel();
                let bulk = OutgoingBulk::new(
                    header,
                    writer,
                    done,
                    inner.config.bulk_copy_buffer_size,
                );
                // If the caller went away the handle drops here and reports abandonment
                let _ = ready.send(Ok(bulk));

                let returned = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    returned = handback => returned,
                };
                match returned {
                    Ok((stream, Ok(()))) => {
                        writer = stream;
                        if let Packet::Bulk(bulk) = &mut packet {
                            bulk.complete_stream();
                        }
                        inner.metrics.bulk_packet_sent(header_bytes + length);
                    }
                    Ok((_, Err(reason))) => {
                        inner.close(reason);
                        break;
                    }
                    Err(_) => {
                        inner.close(CloseReason::Bulk(
                            constants::ERR_BULK_ABANDONED.to_string(),
                        ));
                        break;
                    }
                }
            }
        }
    }

    queue.close();
    let mut discarded = 0usize;
    while queue.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(transport = %inner.name, discarded, "Discarded queued packets");
    }
}
