//! # Exchanges
//!
//! Request/reply bookkeeping for one routed connection.
//!
//! Every outgoing request to actor `A` with type `T` is numbered
//! `(A, T, n)` where `n` counts earlier `T` requests to `A` on the same
//! connection. Replies from `A` complete the oldest pending request to `A`.
//! Two connections driven through the same sequence of actions therefore
//! number their exchanges identically, even though their actor ids differ.
//! That is what lets the router line up actors across connections.
//!
//! Completed replies are scanned for actor announcements. The first exchange
//! that mentions an actor is remembered as that actor's origin.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::{RouterConfig, ROOT_ACTOR};
use crate::error::{ProtocolError, Result};
use crate::router::actor::{KeyPath, SchemaRegistry};
use crate::router::path::ActorPath;
use crate::transport::SharedPacket;

/// Field marking a request that never gets a reply.
pub const ONEWAY_MARKER: &str = "oneway";

/// Field present in the root actor's greeting.
const GREETING_FIELD: &str = "applicationType";

/// Uncorrelated packets kept for inspection.
const UNCORRELATED_HISTORY: usize = 256;

/// `paused` is a reply to `attach` or `interrupt` unless `why.type` is one of these.
const UNSOLICITED_PAUSE_REASONS: [&str; 6] = [
    "resumeLimit",
    "debuggerStatement",
    "breakpoint",
    "DOMEvent",
    "watchpoint",
    "exception",
];

/// Identifies one request by destination, type, and per-(destination, type) sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId {
    pub actor: String,
    pub kind: String,
    pub seq: u64,
}

impl ExchangeId {
    pub fn new(actor: impl Into<String>, kind: impl Into<String>, seq: u64) -> Self {
        Self {
            actor: actor.into(),
            kind: kind.into(),
            seq,
        }
    }

    /// The same exchange addressed to a different actor.
    pub fn with_actor(&self, actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            kind: self.kind.clone(),
            seq: self.seq,
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.actor, self.kind, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request sent, reply not yet seen
    Pending,
    Completed,
}

/// A completed request/reply pair, or an uncorrelated packet (no id).
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: Option<ExchangeId>,
    pub request: Option<SharedPacket>,
    pub reply: Option<SharedPacket>,
    /// The request was mirrored from another connection.
    pub relayed: bool,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    id: ExchangeId,
    request: SharedPacket,
    relayed: bool,
}

/// Where an actor was first announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub exchange: ExchangeId,
    pub key_path: KeyPath,
}

/// How an outgoing packet was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Request(ExchangeId),
    OneWay,
}

/// How an incoming packet was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Reply { id: ExchangeId, relayed: bool },
    Event,
}

/// A reply the connection received before the router was attached.
#[derive(Debug, Clone)]
pub struct BootstrapExchange {
    pub actor: String,
    pub kind: String,
    pub reply: Value,
}

/// Announcements known before the router started observing a connection.
///
/// Bootstrap exchanges are numbered like real ones, so every connection of a
/// router must be bootstrapped with the same sequence of actor/type pairs.
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    exchanges: Vec<BootstrapExchange>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root form (for instance a `listTabs` reply) the connection already holds.
    pub fn root_form(self, kind: &str, form: Value) -> Self {
        self.exchange(ROOT_ACTOR, kind, form)
    }

    /// A reply from `parent` that announced a child during attach.
    pub fn attached(self, parent: &str, kind: &str, form: Value) -> Self {
        self.exchange(parent, kind, form)
    }

    pub fn exchange(mut self, actor: &str, kind: &str, reply: Value) -> Self {
        self.exchanges.push(BootstrapExchange {
            actor: actor.to_string(),
            kind: kind.to_string(),
            reply,
        });
        self
    }

    pub fn exchanges(&self) -> &[BootstrapExchange] {
        &self.exchanges
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

/// Exchange history, announcements, and path cache for one connection.
#[derive(Debug)]
pub struct ExchangeLog {
    config: Arc<RouterConfig>,
    schemas: Arc<SchemaRegistry>,
    counters: HashMap<(String, String), u64>,
    pending: HashMap<String, VecDeque<PendingRequest>>,
    completed: HashMap<ExchangeId, Exchange>,
    uncorrelated: VecDeque<Exchange>,
    pub(crate) announcements: HashMap<String, Announcement>,
    pub(crate) path_cache: HashMap<String, ActorPath>,
    waiters: HashMap<ExchangeId, Vec<oneshot::Sender<()>>>,
}

fn str_field<'a>(packet: &'a Value, key: &str) -> Option<&'a str> {
    packet.get(key).and_then(Value::as_str)
}

impl ExchangeLog {
    pub fn new(config: Arc<RouterConfig>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            config,
            schemas,
            counters: HashMap::new(),
            pending: HashMap::new(),
            completed: HashMap::new(),
            uncorrelated: VecDeque::new(),
            announcements: HashMap::new(),
            path_cache: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn next_id(&mut self, actor: &str, kind: &str) -> ExchangeId {
        let counter = self
            .counters
            .entry((actor.to_string(), kind.to_string()))
            .or_insert(0);
        let id = ExchangeId::new(actor, kind, *counter);
        *counter += 1;
        id
    }

    fn is_oneway(&self, packet: &Value) -> bool {
        if packet.get(ONEWAY_MARKER).and_then(Value::as_bool) == Some(true) {
            return true;
        }
        str_field(packet, "type").is_some_and(|kind| self.config.oneway_types.contains(kind))
    }

    /// Whether an incoming packet is an event rather than a reply.
    pub fn is_unsolicited(&self, packet: &Value) -> bool {
        let Some(from) = str_field(packet, "from") else {
            return true;
        };
        if from == ROOT_ACTOR && packet.get(GREETING_FIELD).is_some() {
            return true;
        }
        match str_field(packet, "type") {
            Some(kind) if self.config.unsolicited_types.contains(kind) => true,
            Some("paused") => packet
                .get("why")
                .and_then(|why| str_field(why, "type"))
                .is_some_and(|why| UNSOLICITED_PAUSE_REASONS.contains(&why)),
            _ => false,
        }
    }

    fn remember_uncorrelated(&mut self, exchange: Exchange) {
        if self.uncorrelated.len() == UNCORRELATED_HISTORY {
            self.uncorrelated.pop_front();
        }
        self.uncorrelated.push_back(exchange);
    }

    /// Classify and record an outgoing packet.
    pub fn record_outgoing(&mut self, packet: &SharedPacket, relayed: bool) -> Outbound {
        let to = match str_field(packet, "to") {
            Some(to) if !self.is_oneway(packet) => to.to_string(),
            _ => {
                self.remember_uncorrelated(Exchange {
                    id: None,
                    request: Some(packet.clone()),
                    reply: None,
                    relayed,
                });
                return Outbound::OneWay;
            }
        };
        let kind = str_field(packet, "type").unwrap_or_default().to_string();
        let id = self.next_id(&to, &kind);
        trace!(exchange = %id, relayed, "Request pending");
        self.pending
            .entry(to)
            .or_default()
            .push_back(PendingRequest {
                id: id.clone(),
                request: packet.clone(),
                relayed,
            });
        Outbound::Request(id)
    }

    /// Classify and record an incoming packet.
    ///
    /// A reply from an actor with no pending request means the two sides are
    /// out of sync, and is reported as [`ProtocolError::UnmatchedReply`].
    pub fn record_incoming(&mut self, packet: &SharedPacket) -> Result<Inbound> {
        if self.is_unsolicited(packet) {
            self.remember_uncorrelated(Exchange {
                id: None,
                request: None,
                reply: Some(packet.clone()),
                relayed: false,
            });
            return Ok(Inbound::Event);
        }

        let from = str_field(packet, "from").unwrap_or_default();
        let request = self
            .pending
            .get_mut(from)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ProtocolError::UnmatchedReply {
                actor: from.to_string(),
            })?;

        let id = request.id.clone();
        let relayed = request.relayed;
        self.complete(Exchange {
            id: Some(request.id),
            request: Some(request.request),
            reply: Some(packet.clone()),
            relayed,
        });
        Ok(Inbound::Reply { id, relayed })
    }

    /// Record replies received before the router was attached.
    pub fn apply_bootstrap(&mut self, bootstrap: &Bootstrap) {
        for exchange in bootstrap.exchanges() {
            let id = self.next_id(&exchange.actor, &exchange.kind);
            debug!(exchange = %id, "Bootstrap exchange");
            self.complete(Exchange {
                id: Some(id),
                request: None,
                reply: Some(Arc::new(exchange.reply.clone())),
                relayed: false,
            });
        }
    }

    fn complete(&mut self, exchange: Exchange) {
        let Some(id) = exchange.id.clone() else {
            return;
        };
        if let Some(reply) = exchange.reply.as_deref() {
            self.discover_announcements(&id, reply);
        }
        self.completed.insert(id.clone(), exchange);

        if let Some(waiters) = self.waiters.remove(&id) {
            debug!(exchange = %id, waiters = waiters.len(), "Waking deferred relays");
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn discover_announcements(&mut self, id: &ExchangeId, reply: &Value) {
        let refs = self
            .schemas
            .actor_refs(&id.kind, reply, self.config.max_scan_depth);
        for found in refs {
            if found.actor == ROOT_ACTOR || self.announcements.contains_key(&found.actor) {
                continue;
            }
            trace!(actor = %found.actor, exchange = %id, key_path = %found.key_path, "Actor announced");
            self.announcements.insert(
                found.actor,
                Announcement {
                    exchange: id.clone(),
                    key_path: found.key_path,
                },
            );
        }
    }

    pub fn completed(&self, id: &ExchangeId) -> Option<&Exchange> {
        self.completed.get(id)
    }

    pub fn state(&self, id: &ExchangeId) -> Option<ExchangeState> {
        if self.completed.contains_key(id) {
            return Some(ExchangeState::Completed);
        }
        self.pending
            .get(&id.actor)
            .filter(|queue| queue.iter().any(|pending| &pending.id == id))
            .map(|_| ExchangeState::Pending)
    }

    pub fn announcement(&self, actor: &str) -> Option<&Announcement> {
        self.announcements.get(actor)
    }

    pub fn pending_count(&self, actor: &str) -> usize {
        self.pending.get(actor).map_or(0, VecDeque::len)
    }

    /// Packets recorded without an id, oldest first.
    pub fn uncorrelated(&self) -> impl Iterator<Item = &Exchange> {
        self.uncorrelated.iter()
    }

    /// Get notified when `id` completes. Returns `None` if it already has.
    pub fn subscribe(&mut self, id: &ExchangeId) -> Option<oneshot::Receiver<()>> {
        if self.completed.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id.clone()).or_default().push(tx);
        Some(rx)
    }

    /// Drop every waiter and cached path. Waiting relays see their
    /// notification channel close and give up. Unanswered requests stay
    /// pending so their replies still correlate.
    pub fn release_waiters(&mut self) {
        self.waiters.clear();
        self.path_cache.clear();
    }

    /// Release waiters and forget unanswered requests.
    pub fn clear(&mut self) {
        self.release_waiters();
        self.pending.clear();
    }
}
