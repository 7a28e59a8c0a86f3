//! # Router
//!
//! Replays one connection's traffic onto its siblings.
//!
//! Several connections to structurally identical debuggees expose the same
//! actor graph under different ids. The router observes every routed
//! connection, correlates requests with replies, and records where each
//! actor was first announced. Requests sent on the **driving** connection are
//! then rewritten into each sibling's ids and sent there too.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use devtools_transport::config::RouterConfig;
//! use devtools_transport::router::{Bootstrap, Router, SchemaRegistry};
//! use devtools_transport::transport::{local::LocalTransport, Transport};
//! use devtools_transport::utils::Metrics;
//!
//! # async fn demo() -> devtools_transport::error::Result<()> {
//! let router = Router::new(RouterConfig::default(), SchemaRegistry::new(), Arc::new(Metrics::new()));
//! let (client_a, _server_a) = LocalTransport::pair();
//! let (client_b, _server_b) = LocalTransport::pair();
//! let a = router.add_connection(Arc::new(client_a), &Bootstrap::new())?;
//! let _b = router.add_connection(Arc::new(client_b), &Bootstrap::new())?;
//! router.set_driving(a.id())?;
//! router.start();
//! a.send(serde_json::json!({"to": "root", "type": "listTabs"}))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Locking
//! Each connection's exchange log has its own lock. Router code holds at most
//! one of them at a time and never while calling into hooks.

pub mod actor;
pub mod exchange;
pub mod path;
mod proxy;
mod relay;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::RouterConfig;
use crate::core::packet::BulkHeader;
use crate::error::{CloseReason, ProtocolError, Result};
use crate::transport::{OutgoingBulk, PacketHooks, Transport};
use crate::utils::metrics::Metrics;

pub use actor::{is_actor_id, is_actor_key, ActorRef, KeyPath, PathSegment, SchemaRegistry};
pub use exchange::{Bootstrap, Exchange, ExchangeId, ExchangeLog, ExchangeState};
pub use path::{ActorPath, PathStep};

use proxy::TransportProxy;
use relay::RelayItem;

/// Marks a packet the router must not mirror. Removed before the packet is sent.
pub const NO_REROUTE_MARKER: &str = "_noReroute";

/// Identifies a connection within one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Remove the no-reroute marker, reporting whether it was set.
fn strip_no_reroute(packet: &mut Value) -> bool {
    packet
        .as_object_mut()
        .and_then(|object| object.remove(NO_REROUTE_MARKER))
        .is_some_and(|marker| marker.as_bool() == Some(true))
}

/// Router state for one connection.
pub(crate) struct ConnectionState {
    pub(crate) id: ConnectionId,
    pub(crate) transport: Arc<dyn Transport>,
    log: Mutex<ExchangeLog>,
    proxy: Mutex<Option<Arc<TransportProxy>>>,
    relay_tx: mpsc::UnboundedSender<RelayItem>,
    pub(crate) cancel: CancellationToken,
}

impl ConnectionState {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        log: ExchangeLog,
        relay_tx: mpsc::UnboundedSender<RelayItem>,
    ) -> Self {
        Self {
            id,
            transport,
            log: Mutex::new(log),
            proxy: Mutex::new(None),
            relay_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn log(&self) -> MutexGuard<'_, ExchangeLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn proxy(&self) -> MutexGuard<'_, Option<Arc<TransportProxy>>> {
        self.proxy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request mirrored from the driving connection.
    pub(crate) fn send_relayed(&self, packet: Value) -> Result<()> {
        let packet = Arc::new(packet);
        // Send and record under one lock so correlation order is wire order
        let mut log = self.log();
        self.transport.send(Value::clone(&packet))?;
        log.record_outgoing(&packet, true);
        Ok(())
    }

    fn uninstall(&self) {
        if let Some(proxy) = self.proxy().take() {
            if !self.transport.is_closed() {
                self.transport.set_hooks(proxy.original.get());
            }
        }
    }
}

pub(crate) struct RouterInner {
    config: Arc<RouterConfig>,
    schemas: Arc<SchemaRegistry>,
    pub(crate) metrics: Arc<Metrics>,
    connections: Mutex<BTreeMap<ConnectionId, Arc<ConnectionState>>>,
    driving: Mutex<Option<ConnectionId>>,
    active: AtomicBool,
    next_id: AtomicU64,
}

impl RouterInner {
    fn connections(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Arc<ConnectionState>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn driving(&self) -> Option<ConnectionId> {
        *self.driving.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn siblings(&self, id: ConnectionId) -> Vec<Arc<ConnectionState>> {
        self.connections()
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    fn install(self: &Arc<Self>, state: &Arc<ConnectionState>) {
        let mut slot = state.proxy();
        if slot.is_some() || state.transport.is_closed() {
            return;
        }
        let proxy = Arc::new(TransportProxy::new(
            state,
            Arc::downgrade(self),
            state.transport.hooks(),
        ));
        let hooks: Arc<dyn PacketHooks> = proxy.clone();
        state.transport.set_hooks(Some(hooks));
        *slot = Some(proxy);
        debug!(connection = %state.id, "Proxy installed");
    }

    /// Drop a connection's router state. Deferred relays targeting it are abandoned.
    pub(crate) fn forget(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        let state = self.connections().remove(&id)?;
        {
            let mut driving = self.driving.lock().unwrap_or_else(PoisonError::into_inner);
            if *driving == Some(id) {
                *driving = None;
            }
        }
        state.cancel.cancel();
        state.log().clear();
        info!(connection = %id, "Connection removed from router");
        Some(state)
    }
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        let connections = self
            .connections
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for state in connections.values() {
            state.cancel.cancel();
        }
    }
}

/// Mirrors the driving connection's requests onto every other connection.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: RouterConfig, schemas: SchemaRegistry, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config: Arc::new(config),
                schemas: Arc::new(schemas),
                metrics,
                connections: Mutex::new(BTreeMap::new()),
                driving: Mutex::new(None),
                active: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a connection. Use the returned handle in place of `transport`.
    ///
    /// `bootstrap` holds replies the connection saw before it was routed.
    /// Must be called from within a Tokio runtime.
    #[instrument(skip_all)]
    pub fn add_connection(
        &self,
        transport: Arc<dyn Transport>,
        bootstrap: &Bootstrap,
    ) -> Result<RoutedConnection> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no Tokio runtime: {e}")))?;

        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut log = ExchangeLog::new(self.inner.config.clone(), self.inner.schemas.clone());
        log.apply_bootstrap(bootstrap);

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionState::new(id, transport, log, relay_tx));
        runtime.spawn(relay::relay_loop(
            state.clone(),
            relay_rx,
            self.inner.config.max_scan_depth,
            self.inner.metrics.clone(),
        ));

        self.inner.connections().insert(id, state.clone());
        if self.inner.is_active() {
            self.inner.install(&state);
        }
        info!(connection = %id, bootstrap = bootstrap.exchanges().len(), "Connection added to router");

        Ok(RoutedConnection {
            state,
            router: Arc::downgrade(&self.inner),
        })
    }

    /// Destroy a connection's router state and restore its original hooks.
    pub fn remove_connection(&self, id: ConnectionId) -> Result<()> {
        let state = self
            .inner
            .forget(id)
            .ok_or(ProtocolError::UnknownConnection(id.0))?;
        state.uninstall();
        Ok(())
    }

    /// Make `id` the only connection whose requests are mirrored.
    pub fn set_driving(&self, id: ConnectionId) -> Result<()> {
        if !self.inner.connections().contains_key(&id) {
            return Err(ProtocolError::UnknownConnection(id.0));
        }
        *self
            .inner
            .driving
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        info!(connection = %id, "Driving connection set");
        Ok(())
    }

    pub fn driving(&self) -> Option<ConnectionId> {
        self.inner.driving()
    }

    /// Install the proxy on every connection. Does nothing if already started.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let states: Vec<_> = self.inner.connections().values().cloned().collect();
        for state in &states {
            self.inner.install(state);
        }
        info!(connections = states.len(), "Router started");
    }

    /// Uninstall every proxy. Unanswered requests stay pending.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let states: Vec<_> = self.inner.connections().values().cloned().collect();
        for state in &states {
            state.uninstall();
            state.log().release_waiters();
        }
        info!(connections = states.len(), "Router stopped");
        self.inner.metrics.log_metrics();
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections().len()
    }

    /// The actor on `to` equivalent to `actor` on `from`.
    pub fn translate(&self, from: ConnectionId, to: ConnectionId, actor: &str) -> Result<String> {
        let (source, target) = {
            let connections = self.inner.connections();
            let source = connections
                .get(&from)
                .cloned()
                .ok_or(ProtocolError::UnknownConnection(from.0))?;
            let target = connections
                .get(&to)
                .cloned()
                .ok_or(ProtocolError::UnknownConnection(to.0))?;
            (source, target)
        };
        let path = source.log().actor_path(actor)?;
        let local = target.log().find_actor(&path)?;
        Ok(local)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("active", &self.is_active())
            .field("connections", &self.connection_count())
            .field("driving", &self.driving())
            .finish()
    }
}

/// A transport observed by a [`Router`].
///
/// Behaves like the wrapped transport. While the router is active, packets
/// sent on the driving connection are also mirrored onto its siblings, and
/// hooks set here are the ones the router's proxy forwards to.
#[derive(Clone)]
pub struct RoutedConnection {
    state: Arc<ConnectionState>,
    router: Weak<RouterInner>,
}

impl RoutedConnection {
    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    /// How `actor` was reached from the root on this connection.
    pub fn actor_path(&self, actor: &str) -> Result<ActorPath> {
        self.state.log().actor_path(actor)
    }

    /// Replay `path` on this connection.
    pub fn find_actor(&self, path: &ActorPath) -> Result<String> {
        self.state.log().find_actor(path)
    }

    /// Run `f` against this connection's exchange log.
    pub fn with_log<T>(&self, f: impl FnOnce(&ExchangeLog) -> T) -> T {
        f(&*self.state.log())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.state.transport
    }
}

impl Transport for RoutedConnection {
    fn ready(&self) -> Result<()> {
        self.state.transport.ready()
    }

    fn send(&self, mut packet: Value) -> Result<()> {
        let no_reroute = strip_no_reroute(&mut packet);
        let Some(router) = self.router.upgrade().filter(|router| router.is_active()) else {
            return self.state.transport.send(packet);
        };

        let siblings = if !no_reroute && router.driving() == Some(self.state.id) {
            router.siblings(self.state.id)
        } else {
            Vec::new()
        };

        let packet = Arc::new(packet);
        let mut log = self.state.log();
        self.state.transport.send(Value::clone(&packet))?;
        log.record_outgoing(&packet, false);
        for sibling in siblings {
            let item = RelayItem {
                source: self.state.clone(),
                packet: packet.clone(),
            };
            if sibling.relay_tx.send(item).is_err() {
                debug!(connection = %sibling.id, "Sibling relay task gone");
            }
        }
        Ok(())
    }

    fn start_bulk_send(&self, header: BulkHeader) -> BoxFuture<'static, Result<OutgoingBulk>> {
        self.state.transport.start_bulk_send(header)
    }

    fn close(&self, reason: CloseReason) {
        self.state.transport.close(reason);
        if let Some(router) = self.router.upgrade() {
            router.forget(self.state.id);
        }
    }

    fn hooks(&self) -> Option<Arc<dyn PacketHooks>> {
        match self.state.proxy().as_ref() {
            Some(proxy) => proxy.original.get(),
            None => self.state.transport.hooks(),
        }
    }

    fn set_hooks(&self, hooks: Option<Arc<dyn PacketHooks>>) {
        let slot = self.state.proxy();
        match slot.as_ref() {
            Some(proxy) => proxy.original.set(hooks),
            None => self.state.transport.set_hooks(hooks),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.transport.is_closed()
    }
}

impl fmt::Debug for RoutedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_reroute_marker_is_stripped() {
        let mut packet = json!({"to": "a.b1", "type": "x", "_noReroute": true});
        assert!(strip_no_reroute(&mut packet));
        assert_eq!(packet, json!({"to": "a.b1", "type": "x"}));

        let mut packet = json!({"to": "a.b1", "_noReroute": false});
        assert!(!strip_no_reroute(&mut packet));
        assert!(packet.get(NO_REROUTE_MARKER).is_none());

        let mut packet = json!({"to": "a.b1"});
        assert!(!strip_no_reroute(&mut packet));
    }

    #[test]
    fn connection_ids_display() {
        assert_eq!(ConnectionId(3).to_string(), "conn3");
    }
}
