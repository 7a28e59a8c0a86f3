//! # Relays
//!
//! Mirrors the driving connection's requests onto its siblings.
//!
//! Each sibling owns one relay task that takes requests in the order the
//! driving connection sent them. Every actor id in a request is translated by
//! resolving its path on the driving connection and replaying the path on the
//! sibling. If the sibling has not yet seen an exchange the path goes
//! through, the task waits for it and tries again; later requests for that
//! sibling wait behind it.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::router::actor::scan_packet_refs;
use crate::router::ConnectionState;
use crate::transport::SharedPacket;
use crate::utils::metrics::Metrics;

/// A request waiting to be mirrored onto one sibling.
pub(crate) struct RelayItem {
    pub(crate) source: Arc<ConnectionState>,
    pub(crate) packet: SharedPacket,
}

/// Translate every actor id in `packet` from `source`'s ids to `target`'s.
///
/// Takes the source's log, then the target's, never both at once.
pub(crate) fn rewrite(
    source: &ConnectionState,
    target: &ConnectionState,
    packet: &Value,
    max_depth: usize,
) -> Result<Value> {
    let refs = scan_packet_refs(packet, max_depth);
    if refs.is_empty() {
        return Ok(packet.clone());
    }

    let paths = {
        let mut log = source.log();
        refs.into_iter()
            .map(|found| {
                log.actor_path(&found.actor)
                    .map(|path| (found.key_path, path))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut rewritten = packet.clone();
    let log = target.log();
    for (key_path, path) in &paths {
        let local = log.find_actor(path)?;
        trace!(from = %path.actor, to = %local, %key_path, "Translated actor");
        key_path.set(&mut rewritten, Value::String(local));
    }
    Ok(rewritten)
}

/// Mirror one request onto `target`, waiting out missing exchanges.
async fn relay_one(target: &ConnectionState, item: &RelayItem, max_depth: usize, metrics: &Metrics) {
    loop {
        let err = match rewrite(&item.source, target, &item.packet, max_depth) {
            Ok(packet) => {
                match target.send_relayed(packet) {
                    Ok(()) => {
                        metrics.relay_forwarded();
                        debug!(from = %item.source.id, to = %target.id, "Relayed request");
                    }
                    Err(e) => {
                        metrics.relay_dropped();
                        warn!(to = %target.id, error = %e, "Sibling refused relayed request");
                    }
                }
                return;
            }
            Err(e) => e,
        };

        match err {
            ProtocolError::MissingExchange(id) => {
                let waiter = target.log().subscribe(&id);
                // Completed between the rewrite and the subscription
                let Some(waiter) = waiter else { continue };
                metrics.relay_deferred();
                debug!(to = %target.id, exchange = %id, "Deferring relay until exchange completes");
                tokio::select! {
                    _ = target.cancel.cancelled() => return,
                    woke = waiter => {
                        if woke.is_err() {
                            metrics.relay_dropped();
                            debug!(to = %target.id, exchange = %id, "Deferred relay abandoned");
                            return;
                        }
                    }
                }
            }
            ProtocolError::CyclicActorPath(actor) => {
                metrics.relay_dropped();
                error!(from = %item.source.id, to = %target.id, %actor, "Cyclic actor path, dropping relay");
                return;
            }
            other => {
                metrics.relay_dropped();
                warn!(from = %item.source.id, to = %target.id, error = %other, "Dropping relay");
                return;
            }
        }
    }
}

/// Relay task for one sibling. Runs until the sibling is removed from its router.
pub(crate) async fn relay_loop(
    target: Arc<ConnectionState>,
    mut items: mpsc::UnboundedReceiver<RelayItem>,
    max_depth: usize,
    metrics: Arc<Metrics>,
) {
    loop {
        let next = tokio::select! {
            _ = target.cancel.cancelled() => break,
            next = items.recv() => next,
        };
        let Some(item) = next else { break };
        relay_one(&target, &item, max_depth, &metrics).await;
    }
    trace!(connection = %target.id, "Relay task finished");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::RouterConfig;
    use crate::router::actor::SchemaRegistry;
    use crate::router::exchange::ExchangeLog;
    use crate::router::ConnectionId;
    use crate::transport::local::LocalTransport;
    use serde_json::json;

    fn state(id: u64) -> ConnectionState {
        let (transport, _peer) = LocalTransport::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionState::new(
            ConnectionId(id),
            Arc::new(transport),
            ExchangeLog::new(
                Arc::new(RouterConfig::default()),
                Arc::new(SchemaRegistry::new()),
            ),
            tx,
        )
    }

    fn exchange(state: &ConnectionState, to: &str, kind: &str, mut reply: Value) {
        let mut log = state.log();
        log.record_outgoing(&Arc::new(json!({"to": to, "type": kind})), false);
        reply["from"] = json!(to);
        log.record_incoming(&Arc::new(reply)).unwrap();
    }

    #[test]
    fn rewrite_translates_destination_and_payload() {
        let a = state(0);
        let b = state(1);
        exchange(&a, "root", "listTabs", json!({"tabs": [{"actor": "a.tab1", "consoleActor": "a.con2"}]}));
        exchange(&b, "root", "listTabs", json!({"tabs": [{"actor": "b.tab5", "consoleActor": "b.con6"}]}));

        let request = json!({"to": "a.tab1", "type": "evaluate", "consoleActor": "a.con2", "text": "a.tab1"});
        let rewritten = rewrite(&a, &b, &request, 32).unwrap();
        assert_eq!(
            rewritten,
            json!({"to": "b.tab5", "type": "evaluate", "consoleActor": "b.con6", "text": "a.tab1"})
        );
    }

    #[test]
    fn rewrite_leaves_root_requests_alone() {
        let a = state(0);
        let b = state(1);
        let request = json!({"to": "root", "type": "listTabs"});
        assert_eq!(rewrite(&a, &b, &request, 32).unwrap(), request);
    }

    #[test]
    fn rewrite_reports_missing_exchange_on_target() {
        let a = state(0);
        let b = state(1);
        exchange(&a, "root", "listTabs", json!({"tabs": [{"actor": "a.tab1"}]}));
        let err = rewrite(&a, &b, &json!({"to": "a.tab1", "type": "attach"}), 32).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn rewrite_reports_unknown_actor() {
        let a = state(0);
        let b = state(1);
        let err = rewrite(&a, &b, &json!({"to": "a.ghost9", "type": "attach"}), 32).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownActor(actor) if actor == "a.ghost9"));
    }
}
