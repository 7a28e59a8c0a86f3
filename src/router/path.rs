//! # Actor Paths
//!
//! An actor's path is the chain of exchanges that led to it from the root:
//!
//! ```text
//! root --(root, listTabs, 0) @ ["tabs",0,"actor"]--> tab
//!      --(tab, attach, 0)    @ ["threadActor"]-----> thread
//! ```
//!
//! Each step names its parent's exchange with the parent id left as a
//! template. Replaying a path on another connection substitutes that
//! connection's own ids step by step, ending at its equivalent actor.

use std::collections::HashSet;

use tracing::trace;

use crate::config::ROOT_ACTOR;
use crate::error::{ProtocolError, Result};
use crate::router::actor::KeyPath;
use crate::router::exchange::{ExchangeId, ExchangeLog};

/// One hop from a parent actor to a child it announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub parent: String,
    pub child: String,
    /// The announcing exchange; its actor is replaced when replayed.
    pub exchange: ExchangeId,
    pub key_path: KeyPath,
}

/// Steps from the root to `actor`, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorPath {
    pub actor: String,
    pub steps: Vec<PathStep>,
}

impl ActorPath {
    pub fn root() -> Self {
        Self {
            actor: ROOT_ACTOR.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// `(exchange template, key path)` pairs, outermost first.
    pub fn templates(&self) -> impl Iterator<Item = (&ExchangeId, &KeyPath)> {
        self.steps.iter().map(|step| (&step.exchange, &step.key_path))
    }
}

impl ExchangeLog {
    /// Resolve how `actor` was reached from the root on this connection.
    ///
    /// Results are cached until the log is cleared.
    pub fn actor_path(&mut self, actor: &str) -> Result<ActorPath> {
        if actor == ROOT_ACTOR {
            return Ok(ActorPath::root());
        }
        if let Some(path) = self.path_cache.get(actor) {
            return Ok(path.clone());
        }

        let mut steps = Vec::new();
        let mut visited = HashSet::from([actor.to_string()]);
        let mut current = actor.to_string();
        loop {
            let announcement = self
                .announcements
                .get(&current)
                .ok_or_else(|| ProtocolError::UnknownActor(current.clone()))?;
            let parent = announcement.exchange.actor.clone();
            if !visited.insert(parent.clone()) {
                return Err(ProtocolError::CyclicActorPath(actor.to_string()));
            }
            steps.push(PathStep {
                parent: parent.clone(),
                child: current,
                exchange: announcement.exchange.clone(),
                key_path: announcement.key_path.clone(),
            });
            if parent == ROOT_ACTOR {
                break;
            }
            current = parent;
        }
        steps.reverse();

        let path = ActorPath {
            actor: actor.to_string(),
            steps,
        };
        trace!(actor, steps = path.len(), "Resolved actor path");
        self.path_cache.insert(actor.to_string(), path.clone());
        Ok(path)
    }

    /// Replay `path` on this connection and return the local equivalent actor.
    ///
    /// Fails with [`ProtocolError::MissingExchange`] when a step's exchange has
    /// not completed here yet; the caller may wait for it and retry.
    pub fn find_actor(&self, path: &ActorPath) -> Result<String> {
        let mut current = ROOT_ACTOR.to_string();
        for step in &path.steps {
            let id = step.exchange.with_actor(&current);
            let exchange = self
                .completed(&id)
                .ok_or_else(|| ProtocolError::MissingExchange(id.clone()))?;
            let next = exchange
                .reply
                .as_deref()
                .and_then(|reply| step.key_path.actor_in(reply))
                .ok_or_else(|| ProtocolError::PathMismatch {
                    exchange: id.clone(),
                    key_path: step.key_path.to_string(),
                })?;
            current = next.to_string();
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::RouterConfig;
    use crate::router::actor::SchemaRegistry;
    use crate::router::exchange::Bootstrap;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn log() -> ExchangeLog {
        ExchangeLog::new(
            Arc::new(RouterConfig::default()),
            Arc::new(SchemaRegistry::new()),
        )
    }

    fn exchange(log: &mut ExchangeLog, to: &str, kind: &str, reply: Value) {
        log.record_outgoing(&Arc::new(json!({"to": to, "type": kind})), false);
        let mut reply = reply;
        reply["from"] = json!(to);
        log.record_incoming(&Arc::new(reply)).unwrap();
    }

    #[test]
    fn path_walks_back_to_root() {
        let mut log = log();
        exchange(&mut log, "root", "listTabs", json!({"frames": [{"actor": "a.f1"}]}));
        exchange(&mut log, "a.f1", "getWindow", json!({"window": {"actor": "a.w2"}}));
        // `window.actor` is an `actor` key nested under `window`
        let path = log.actor_path("a.w2").unwrap();
        assert_eq!(
            path.steps,
            vec![
                PathStep {
                    parent: "root".into(),
                    child: "a.f1".into(),
                    exchange: ExchangeId::new("root", "listTabs", 0),
                    key_path: KeyPath::new(vec!["frames".into(), 0.into(), "actor".into()]),
                },
                PathStep {
                    parent: "a.f1".into(),
                    child: "a.w2".into(),
                    exchange: ExchangeId::new("a.f1", "getWindow", 0),
                    key_path: KeyPath::new(vec!["window".into(), "actor".into()]),
                },
            ]
        );
    }

    #[test]
    fn replay_finds_equivalent_actor() {
        let mut a = log();
        exchange(&mut a, "root", "listTabs", json!({"frames": [{"actor": "a.f1"}]}));
        exchange(&mut a, "a.f1", "getWindow", json!({"window": {"actor": "a.w2"}}));

        let mut b = log();
        exchange(&mut b, "root", "listTabs", json!({"frames": [{"actor": "b.f7"}]}));
        exchange(&mut b, "b.f7", "getWindow", json!({"window": {"actor": "b.w8"}}));

        let path = a.actor_path("a.w2").unwrap();
        assert_eq!(b.find_actor(&path).unwrap(), "b.w8");
    }

    #[test]
    fn replay_reports_missing_exchange() {
        let mut a = log();
        exchange(&mut a, "root", "listTabs", json!({"frames": [{"actor": "a.f1"}]}));
        exchange(&mut a, "a.f1", "getWindow", json!({"window": {"actor": "a.w2"}}));

        let mut b = log();
        exchange(&mut b, "root", "listTabs", json!({"frames": [{"actor": "b.f7"}]}));

        let path = a.actor_path("a.w2").unwrap();
        let err = b.find_actor(&path).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingExchange(id) if id == ExchangeId::new("b.f7", "getWindow", 0)));
    }

    #[test]
    fn self_announcement_is_cyclic() {
        let mut log = log();
        log.record_outgoing(&Arc::new(json!({"to": "a.x1", "type": "hello"})), false);
        log.record_incoming(&Arc::new(json!({"from": "a.x1", "actor": "a.x1"})))
            .unwrap();
        assert!(matches!(
            log.actor_path("a.x1"),
            Err(ProtocolError::CyclicActorPath(_))
        ));
    }

    #[test]
    fn unknown_actor_is_reported() {
        let mut log = log();
        assert!(matches!(
            log.actor_path("a.nope1"),
            Err(ProtocolError::UnknownActor(_))
        ));
    }

    #[test]
    fn bootstrap_announcements_resolve() {
        let mut log = log();
        log.apply_bootstrap(
            &Bootstrap::new().root_form("listTabs", json!({"tabs": [{"actor": "a.tab1"}]})),
        );
        let path = log.actor_path("a.tab1").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(log.find_actor(&path).unwrap(), "a.tab1");
        assert!(log.actor_path("root").unwrap().is_root());
    }
}
