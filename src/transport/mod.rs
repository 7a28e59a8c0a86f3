//! # Transport Layer
//!
//! A transport moves packets between two endpoints of a debugging session.
//!
//! Every variant offers the same surface:
//! - `ready()` starts delivering incoming packets to the installed [`PacketHooks`]
//! - `send()` queues a JSON packet; packets reach the peer in send order
//! - `start_bulk_send()` queues a bulk packet and resolves once the caller may
//!   stream its body
//! - `close()` stops delivery, drops anything still queued, and notifies the
//!   hooks exactly once
//!
//! ## Variants
//! - [`stream::DebuggerTransport`]: framed packets over any async byte stream
//! - [`local::LocalTransport`]: an in-process pair with no serialization
//! - [`child::ChildTransport`]: JSON packets relayed over a message channel
//!
//! Hooks are swappable at any time, which is how the router installs its proxy.

pub mod bulk;
pub mod child;
pub mod local;
pub mod stream;

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{CloseReason, Result};

pub use crate::core::packet::BulkHeader;
pub use bulk::{IncomingBulk, OutgoingBulk};

/// A packet shared between the transport, the router, and the hooks.
pub type SharedPacket = Arc<Value>;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives what a transport delivers.
pub trait PacketHooks: Send + Sync {
    /// A JSON packet arrived.
    fn on_packet(&self, packet: SharedPacket);

    /// A bulk packet arrived. The transport reads nothing else until the
    /// handle has copied the body or been dropped, and dropping it early
    /// closes the transport.
    fn on_bulk_packet(&self, packet: IncomingBulk) {
        tracing::warn!(actor = %packet.actor(), kind = %packet.kind(), "No bulk consumer, dropping packet");
    }

    /// The transport closed. Called at most once per transport.
    fn on_closed(&self, reason: &CloseReason);
}

/// A bidirectional packet channel.
pub trait Transport: Send + Sync {
    /// Begin delivering incoming packets. Must be called from within a Tokio runtime.
    fn ready(&self) -> Result<()>;

    /// Queue a JSON packet.
    fn send(&self, packet: Value) -> Result<()>;

    /// Queue a bulk packet. The returned handle is used to write exactly
    /// `header.length` bytes.
    fn start_bulk_send(&self, header: BulkHeader) -> BoxFuture<'static, Result<OutgoingBulk>>;

    /// Close the transport. Only the first call has any effect.
    fn close(&self, reason: CloseReason);

    fn hooks(&self) -> Option<Arc<dyn PacketHooks>>;

    fn set_hooks(&self, hooks: Option<Arc<dyn PacketHooks>>);

    fn is_closed(&self) -> bool;
}

/// Hook storage shared by the transport implementations.
#[derive(Default)]
pub(crate) struct HookSlot {
    hooks: Mutex<Option<Arc<dyn PacketHooks>>>,
}

impl HookSlot {
    pub(crate) fn get(&self) -> Option<Arc<dyn PacketHooks>> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, hooks: Option<Arc<dyn PacketHooks>>) {
        *self.hooks.lock().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn PacketHooks>> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSlot")
            .field("installed", &self.get().is_some())
            .finish()
    }
}
