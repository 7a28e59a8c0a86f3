//! # Cross-Process Transport
//!
//! [`ChildTransport`] carries JSON packets over an existing message channel to
//! a child process, one message per packet. The channel already preserves
//! message boundaries, so there is no framing.
//!
//! Several debugger servers can share one channel: each transport only sends
//! and accepts messages named `debug:<prefix>:packet`. Bulk packets cannot
//! cross the channel and fail with [`ProtocolError::BulkUnsupported`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::core::packet::BulkHeader;
use crate::error::{CloseReason, ProtocolError, Result};
use crate::transport::{HookSlot, OutgoingBulk, PacketHooks, Transport};

/// One message on the parent/child channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildMessage {
    pub name: String,
    pub data: Value,
}

/// The message name used for packets under `prefix`.
pub fn packet_message_name(prefix: &str) -> String {
    format!("debug:{prefix}:packet")
}

struct ChildInner {
    message_name: String,
    sender: mpsc::UnboundedSender<ChildMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChildMessage>>>,
    hooks: HookSlot,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Packet transport over a message channel to or from a child process.
#[derive(Clone)]
pub struct ChildTransport {
    inner: Arc<ChildInner>,
}

impl ChildTransport {
    pub fn new(
        sender: mpsc::UnboundedSender<ChildMessage>,
        receiver: mpsc::UnboundedReceiver<ChildMessage>,
        prefix: &str,
    ) -> Self {
        Self {
            inner: Arc::new(ChildInner {
                message_name: packet_message_name(prefix),
                sender,
                receiver: Mutex::new(Some(receiver)),
                hooks: HookSlot::default(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Two transports wired to each other, as a parent and its child would be.
    pub fn pair(prefix: &str) -> (Self, Self) {
        let (parent_tx, child_rx) = mpsc::unbounded_channel();
        let (child_tx, parent_rx) = mpsc::unbounded_channel();
        (
            Self::new(parent_tx, parent_rx, prefix),
            Self::new(child_tx, child_rx, prefix),
        )
    }

    pub fn message_name(&self) -> &str {
        &self.inner.message_name
    }
}

impl ChildInner {
    fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(message = %self.message_name, %reason, "Child transport closed");
        if let Some(hooks) = self.hooks.take() {
            hooks.on_closed(&reason);
        }
    }
}

async fn listen(inner: Arc<ChildInner>, mut receiver: mpsc::UnboundedReceiver<ChildMessage>) {
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            next = receiver.recv() => next,
        };
        let Some(message) = next else {
            inner.close(CloseReason::StreamClosed);
            return;
        };
        if message.name != inner.message_name {
            trace!(name = %message.name, "Ignoring message for another server");
            continue;
        }
        match inner.hooks.get() {
            Some(hooks) => hooks.on_packet(Arc::new(message.data)),
            None => warn!(message = %inner.message_name, "No hooks installed, dropping packet"),
        }
    }
}

impl Transport for ChildTransport {
    #[instrument(skip(self), fields(message = %self.inner.message_name))]
    fn ready(&self) -> Result<()> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            if self.is_closed() {
                return Err(ProtocolError::Closed(CloseReason::StreamClosed));
            }
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no Tokio runtime: {e}")))?;
        runtime.spawn(listen(self.inner.clone(), receiver));
        debug!("Listening for child messages");
        Ok(())
    }

    fn send(&self, packet: Value) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::Closed(CloseReason::StreamClosed));
        }
        self.inner
            .sender
            .send(ChildMessage {
                name: self.inner.message_name.clone(),
                data: packet,
            })
            .map_err(|_| ProtocolError::Closed(CloseReason::StreamClosed))
    }

    fn start_bulk_send(&self, header: BulkHeader) -> BoxFuture<'static, Result<OutgoingBulk>> {
        warn!(actor = %header.actor, kind = %header.kind, "Refusing bulk send to child process");
        future::ready(Err(ProtocolError::BulkUnsupported)).boxed()
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

impl std::fmt::Debug for ChildTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildTransport")
            .field("message_name", &self.inner.message_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
