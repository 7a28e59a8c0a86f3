//! # Transport Proxy
//!
//! The hooks the router installs on a routed transport. Every incoming
//! packet is recorded in the connection's exchange log before it reaches the
//! owner's own hooks, which the proxy keeps and forwards to. Replies to
//! requests the router relayed onto this connection stop here: the owner
//! never sent those requests.

use std::sync::{Arc, Weak};

use tracing::{error, trace, warn};

use crate::error::CloseReason;
use crate::router::exchange::Inbound;
use crate::router::{ConnectionState, RouterInner};
use crate::transport::{HookSlot, IncomingBulk, PacketHooks, SharedPacket};

pub(crate) struct TransportProxy {
    state: Weak<ConnectionState>,
    router: Weak<RouterInner>,
    pub(crate) original: HookSlot,
}

impl TransportProxy {
    pub(crate) fn new(
        state: &Arc<ConnectionState>,
        router: Weak<RouterInner>,
        original: Option<Arc<dyn PacketHooks>>,
    ) -> Self {
        let slot = HookSlot::default();
        slot.set(original);
        Self {
            state: Arc::downgrade(state),
            router,
            original: slot,
        }
    }

    fn forward(&self, packet: SharedPacket) {
        if let Some(hooks) = self.original.get() {
            hooks.on_packet(packet);
        }
    }
}

impl PacketHooks for TransportProxy {
    fn on_packet(&self, packet: SharedPacket) {
        let Some(router) = self.router.upgrade().filter(|router| router.is_active()) else {
            return self.forward(packet);
        };
        let Some(state) = self.state.upgrade() else {
            return self.forward(packet);
        };

        let recorded = state.log().record_incoming(&packet);
        match recorded {
            Ok(Inbound::Reply { id, relayed: true }) => {
                router.metrics.exchange_completed();
                trace!(connection = %state.id, exchange = %id, "Consumed reply to relayed request");
            }
            Ok(Inbound::Reply { .. }) => {
                router.metrics.exchange_completed();
                self.forward(packet);
            }
            Ok(Inbound::Event) => self.forward(packet),
            Err(e) => {
                router.metrics.protocol_error();
                error!(connection = %state.id, error = %e, "Lost request/reply synchronization");
                state.transport.close(CloseReason::from_error(&e));
            }
        }
    }

    fn on_bulk_packet(&self, packet: IncomingBulk) {
        match self.original.get() {
            Some(hooks) => hooks.on_bulk_packet(packet),
            None => warn!(actor = %packet.actor(), kind = %packet.kind(), "No bulk consumer, dropping packet"),
        }
    }

    fn on_closed(&self, reason: &CloseReason) {
        if let (Some(router), Some(state)) = (self.router.upgrade(), self.state.upgrade()) {
            router.forget(state.id);
        }
        if let Some(hooks) = self.original.take() {
            hooks.on_closed(reason);
        }
    }
}

impl std::fmt::Debug for TransportProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportProxy")
            .field("original", &self.original)
            .finish()
    }
}
