//! # Same-Process Transport
//!
//! [`LocalTransport::pair`] connects two endpoints living in one process.
//! Packets are not serialized: the sender's object is wrapped in an `Arc` and
//! handed to the peer, which receives it on its own delivery task, never
//! inside the sender's `send` call. Sharing an immutable `Arc<Value>` means
//! neither side can change what the other sees.
//!
//! Bulk packets go through a private in-memory pipe so bulk call sites look
//! the same as with a [`DebuggerTransport`](super::stream::DebuggerTransport).
//!
//! Both endpoints number packets from one shared serial counter; the numbers
//! appear in trace logs. Closing either endpoint closes the other.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::core::packet::BulkHeader;
use crate::error::{CloseReason, ProtocolError, Result};
use crate::transport::bulk::Returned;
use crate::transport::{
    BoxedReader, BoxedWriter, HookSlot, IncomingBulk, OutgoingBulk, PacketHooks, SharedPacket,
    Transport,
};
use crate::utils::metrics::Metrics;

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(0);

enum Delivery {
    Packet { serial: u64, packet: SharedPacket },
    Bulk { serial: u64, bulk: IncomingBulk },
}

struct LocalInner {
    name: String,
    config: TransportConfig,
    hooks: HookSlot,
    peer: Mutex<Weak<LocalInner>>,
    serial: Arc<AtomicU64>,
    inbox: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

/// One endpoint of an in-process transport pair.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

impl LocalTransport {
    /// Create two connected endpoints with default settings.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_config(&TransportConfig::default(), Arc::new(Metrics::new()))
    }

    pub fn pair_with_config(config: &TransportConfig, metrics: Arc<Metrics>) -> (Self, Self) {
        let id = NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed);
        let serial = Arc::new(AtomicU64::new(0));
        let first = LocalInner::new(format!("local-{id}a"), config, serial.clone(), metrics.clone());
        let second = LocalInner::new(format!("local-{id}b"), config, serial, metrics);
        first.set_peer(&second);
        second.set_peer(&first);
        (Self { inner: first }, Self { inner: second })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn peer(&self) -> Result<Arc<LocalInner>> {
        self.inner
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .ok_or(ProtocolError::Closed(CloseReason::StreamClosed))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(ProtocolError::Closed(CloseReason::StreamClosed));
        }
        Ok(())
    }

    fn queue_bulk(&self, header: BulkHeader) -> Result<OutgoingBulk> {
        self.ensure_open()?;
        let runtime = Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no Tokio runtime: {e}")))?;
        let peer = self.peer()?;
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);

        let (writer, reader) = tokio::io::duplex(self.inner.config.local_pipe_capacity);
        let buffer_size = self.inner.config.bulk_copy_buffer_size;

        let (reader_done, reader_handback) = oneshot::channel();
        let reader: BoxedReader = Box::new(reader);
        let bulk = IncomingBulk::new(header.clone(), Bytes::new(), reader, reader_done, buffer_size);
        peer.watch_bulk(&runtime, reader_handback);
        peer.push(Delivery::Bulk { serial, bulk })?;

        let (writer_done, writer_handback) = oneshot::channel();
        let writer: BoxedWriter = Box::new(writer);
        self.inner.watch_bulk(&runtime, writer_handback);
        self.inner.metrics.bulk_packet_sent(header.length);
        Ok(OutgoingBulk::new(header, writer, writer_done, buffer_size))
    }
}

impl LocalInner {
    fn new(
        name: String,
        config: &TransportConfig,
        serial: Arc<AtomicU64>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            config: config.clone(),
            hooks: HookSlot::default(),
            peer: Mutex::new(Weak::new()),
            serial,
            inbox: Mutex::new(Some(tx)),
            deliveries: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            metrics,
        })
    }

    fn set_peer(&self, peer: &Arc<LocalInner>) {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(peer);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn push(&self, delivery: Delivery) -> Result<()> {
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        match inbox.as_ref() {
            Some(tx) => tx
                .send(delivery)
                .map_err(|_| ProtocolError::Closed(CloseReason::StreamClosed)),
            None => Err(ProtocolError::Closed(CloseReason::StreamClosed)),
        }
    }

    fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.metrics.transport_closed();
        info!(transport = %self.name, %reason, "Transport closed");

        if let Some(hooks) = self.hooks.take() {
            hooks.on_closed(&reason);
        }

        let peer = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(peer) = peer {
            peer.close(reason);
        }
    }

    /// Close this endpoint if a bulk copy through the pipe fails.
    fn watch_bulk<S: Send + 'static>(
        self: &Arc<Self>,
        runtime: &Handle,
        handback: oneshot::Receiver<Returned<S>>,
    ) {
        let inner = Arc::downgrade(self);
        runtime.spawn(async move {
            let reason = match handback.await {
                Ok((_, Ok(()))) => return,
                Ok((_, Err(reason))) => reason,
                Err(_) => CloseReason::Bulk(crate::error::constants::ERR_BULK_ABANDONED.to_string()),
            };
            if let Some(inner) = inner.upgrade() {
                inner.close(reason);
            }
        });
    }
}

async fn deliver_loop(inner: Arc<LocalInner>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = deliveries.recv() => next,
        };
        let Some(delivery) = next else { break };
        if inner.is_closed() {
            break;
        }

        let hooks = inner.hooks.get();
        match delivery {
            Delivery::Packet { serial, packet } => {
                trace!(transport = %inner.name, serial, "Delivering packet");
                if inner.config.log_packets {
                    debug!(transport = %inner.name, serial, packet = %packet, "Received packet");
                }
                inner.metrics.packet_received();
                match hooks {
                    Some(hooks) => hooks.on_packet(packet),
                    None => warn!(transport = %inner.name, serial, "No hooks installed, dropping packet"),
                }
            }
            Delivery::Bulk { serial, bulk } => {
                trace!(transport = %inner.name, serial, actor = %bulk.actor(), "Delivering bulk packet");
                inner.metrics.bulk_packet_received();
                if let Some(hooks) = hooks {
                    hooks.on_bulk_packet(bulk);
                }
            }
        }
    }
}

impl Transport for LocalTransport {
    #[instrument(skip(self), fields(transport = %self.inner.name))]
    fn ready(&self) -> Result<()> {
        let deliveries = self
            .inner
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(deliveries) = deliveries else {
            return self.ensure_open();
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no Tokio runtime: {e}")))?;
        runtime.spawn(deliver_loop(self.inner.clone(), deliveries));
        self.inner.metrics.transport_opened();
        info!("Transport ready");
        Ok(())
    }

    fn send(&self, packet: Value) -> Result<()> {
        self.ensure_open()?;
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
        if self.inner.config.log_packets {
            debug!(transport = %self.inner.name, serial, %packet, "Sending packet");
        }
        self.peer()?.push(Delivery::Packet {
            serial,
            packet: Arc::new(packet),
        })?;
        self.inner.metrics.packet_sent(0);
        Ok(())
    }

    fn start_bulk_send(&self, header: BulkHeader) -> BoxFuture<'static, Result<OutgoingBulk>> {
        // Queued before returning; later sends follow this packet
        let queued = self.queue_bulk(header);
        async move {
            let bulk = queued?;
            // Resolve on a later turn, as the framed transport would
            tokio::task::yield_now().await;
            Ok(bulk)
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
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
