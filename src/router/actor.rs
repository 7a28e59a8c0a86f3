//! # Actor References
//!
//! Finding actor ids inside packets, and addressing them by key path.
//!
//! An actor id is an ASCII token of at least two `[A-Za-z0-9_-]+` segments
//! joined by `.` or `/`, such as `server1.conn0.tab3`. A field holds an actor
//! reference when its key is `actor` or ends in `Actor`. `from` never does;
//! it names the sender.
//!
//! When a request type has a registered schema, only the schema's paths are
//! consulted. Otherwise a depth-limited walk visits the whole reply.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tracing::trace;

/// Fields that name the sender and are never references.
const SENDER_KEY: &str = "from";

/// The request destination field.
pub const DESTINATION_KEY: &str = "to";

/// Whether `value` has the shape of an actor id.
pub fn is_actor_id(value: &str) -> bool {
    if !value.is_ascii() {
        return false;
    }
    let mut segments = 0usize;
    for segment in value.split(|c: char| c == '.' || c == '/') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Whether a field named `key` holds actor references.
pub fn is_actor_key(key: &str) -> bool {
    key != SENDER_KEY && (key == "actor" || key.ends_with("Actor"))
}

/// One step into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Where a value lives inside a packet, outermost key first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<PathSegment>);

impl KeyPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(value, |current, segment| match segment {
            PathSegment::Key(key) => current.get(key.as_str()),
            PathSegment::Index(index) => current.get(*index),
        })
    }

    pub fn get_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Value> {
        self.0
            .iter()
            .try_fold(value, |current, segment| match segment {
                PathSegment::Key(key) => current.get_mut(key.as_str()),
                PathSegment::Index(index) => current.get_mut(*index),
            })
    }

    /// The actor id stored at this path, if there is one.
    pub fn actor_in<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.get(value)
            .and_then(Value::as_str)
            .filter(|actor| is_actor_id(actor))
    }

    /// Replace the value at this path. Returns `false` if the path does not exist.
    pub fn set(&self, value: &mut Value, replacement: Value) -> bool {
        match self.get_mut(value) {
            Some(slot) => {
                *slot = replacement;
                true
            }
            None => false,
        }
    }
}

impl<S: Into<PathSegment>> FromIterator<S> for KeyPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match segment {
                PathSegment::Key(key) => write!(f, "{key:?}")?,
                PathSegment::Index(index) => write!(f, "{index}")?,
            }
        }
        f.write_str("]")
    }
}

/// An actor id found in a packet, with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRef {
    pub key_path: KeyPath,
    pub actor: String,
}

fn push_if_actor(value: &Value, path: &[PathSegment], out: &mut Vec<ActorRef>) {
    match value {
        Value::String(actor) if is_actor_id(actor) => out.push(ActorRef {
            key_path: KeyPath(path.to_vec()),
            actor: actor.clone(),
        }),
        // Lists of actors, e.g. `threadActors: [..]`
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                if let Value::String(actor) = item {
                    if is_actor_id(actor) {
                        let mut key_path = path.to_vec();
                        key_path.push(PathSegment::Index(index));
                        out.push(ActorRef {
                            key_path: KeyPath(key_path),
                            actor: actor.clone(),
                        });
                    }
                }
            }
        }
        _ => {}
    }
}

fn walk(
    value: &Value,
    path: &mut Vec<PathSegment>,
    depth: usize,
    max_depth: usize,
    out: &mut Vec<ActorRef>,
) {
    if depth >= max_depth {
        trace!(depth, "Actor scan depth limit reached");
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == SENDER_KEY {
                    continue;
                }
                path.push(PathSegment::Key(key.clone()));
                if is_actor_key(key) {
                    push_if_actor(child, path, out);
                }
                if child.is_object() || child.is_array() {
                    walk(child, path, depth + 1, max_depth, out);
                }
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                if item.is_object() || item.is_array() {
                    path.push(PathSegment::Index(index));
                    walk(item, path, depth + 1, max_depth, out);
                    path.pop();
                }
            }
        }
        _ => {}
    }
}

/// Every actor reference in `value` under the generic key rule.
pub fn scan_actor_refs(value: &Value, max_depth: usize) -> Vec<ActorRef> {
    let mut out = Vec::new();
    walk(value, &mut Vec::new(), 0, max_depth, &mut out);
    out
}

/// Every actor reference in an outgoing request, including its destination.
pub fn scan_packet_refs(packet: &Value, max_depth: usize) -> Vec<ActorRef> {
    let mut out = Vec::new();
    if let Some(to) = packet.get(DESTINATION_KEY).and_then(Value::as_str) {
        if is_actor_id(to) {
            out.push(ActorRef {
                key_path: KeyPath::from_iter([DESTINATION_KEY]),
                actor: to.to_string(),
            });
        }
    }
    walk(packet, &mut Vec::new(), 0, max_depth, &mut out);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemaSegment {
    Key(String),
    Index(usize),
    AnyIndex,
}

/// Explicit actor locations in the replies to one request type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    by_type: HashMap<String, Vec<Vec<SchemaSegment>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register dotted paths such as `tabs.*.actor` for replies to `kind`.
    /// `*` matches every array index; a number matches one index.
    pub fn register<I, S>(&mut self, kind: &str, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = paths
            .into_iter()
            .map(|path| {
                path.as_ref()
                    .split('.')
                    .map(|part| match part {
                        "*" => SchemaSegment::AnyIndex,
                        _ => match part.parse::<usize>() {
                            Ok(index) => SchemaSegment::Index(index),
                            Err(_) => SchemaSegment::Key(part.to_string()),
                        },
                    })
                    .collect()
            })
            .collect();
        self.by_type.insert(kind.to_string(), parsed);
    }

    pub fn with(mut self, kind: &str, paths: &[&str]) -> Self {
        self.register(kind, paths.iter().copied());
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_type.contains_key(kind)
    }

    /// Actor references in a reply to a `kind` request.
    pub fn actor_refs(&self, kind: &str, reply: &Value, max_depth: usize) -> Vec<ActorRef> {
        let Some(paths) = self.by_type.get(kind) else {
            return scan_actor_refs(reply, max_depth);
        };
        let mut out = Vec::new();
        for schema in paths {
            expand(reply, schema, &mut Vec::new(), &mut out);
        }
        out
    }
}

fn expand(
    value: &Value,
    schema: &[SchemaSegment],
    path: &mut Vec<PathSegment>,
    out: &mut Vec<ActorRef>,
) {
    let Some((first, rest)) = schema.split_first() else {
        if let Some(actor) = value.as_str().filter(|actor| is_actor_id(actor)) {
            out.push(ActorRef {
                key_path: KeyPath(path.clone()),
                actor: actor.to_string(),
            });
        }
        return;
    };
    match first {
        SchemaSegment::Key(key) => {
            if let Some(child) = value.get(key.as_str()) {
                path.push(PathSegment::Key(key.clone()));
                expand(child, rest, path, out);
                path.pop();
            }
        }
        SchemaSegment::Index(index) => {
            if let Some(child) = value.get(*index) {
                path.push(PathSegment::Index(*index));
                expand(child, rest, path, out);
                path.pop();
            }
        }
        SchemaSegment::AnyIndex => {
            if let Some(items) = value.as_array() {
                for (index, child) in items.iter().enumerate() {
                    path.push(PathSegment::Index(index));
                    expand(child, rest, path, out);
                    path.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actor_id_shape() {
        assert!(is_actor_id("conn0.tab1"));
        assert!(is_actor_id("server1.conn0.child2/frame-3"));
        assert!(!is_actor_id("root"));
        assert!(!is_actor_id("conn0..tab1"));
        assert!(!is_actor_id("conn0.tab 1"));
        assert!(!is_actor_id("connö.tab1"));
        assert!(!is_actor_id(""));
    }

    #[test]
    fn actor_keys() {
        assert!(is_actor_key("actor"));
        assert!(is_actor_key("consoleActor"));
        assert!(!is_actor_key("from"));
        assert!(!is_actor_key("actors"));
    }

    #[test]
    fn walker_finds_nested_references() {
        let reply = json!({
            "from": "conn0.root2",
            "frames": [{"actor": "conn0.frame1", "title": "a.b"}],
            "consoleActor": "conn0.console3",
            "threadActors": ["conn0.thread4"],
            "actor": "not-an-actor"
        });
        let found: Vec<_> = scan_actor_refs(&reply, 32)
            .into_iter()
            .map(|r| (r.key_path.to_string(), r.actor))
            .collect();
        assert!(found.contains(&("[\"frames\",0,\"actor\"]".into(), "conn0.frame1".into())));
        assert!(found.contains(&("[\"consoleActor\"]".into(), "conn0.console3".into())));
        assert!(found.contains(&("[\"threadActors\",0]".into(), "conn0.thread4".into())));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn walker_respects_depth_limit() {
        let reply = json!({"a": {"b": {"actor": "conn0.deep1"}}, "actor": "conn0.top1"});
        let shallow = scan_actor_refs(&reply, 1);
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].actor, "conn0.top1");
        assert_eq!(scan_actor_refs(&reply, 3).len(), 2);
    }

    #[test]
    fn packet_scan_includes_destination() {
        let packet = json!({"to": "conn0.tab1", "type": "attach", "from": "conn0.x2"});
        let refs = scan_packet_refs(&packet, 32);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key_path, KeyPath::from_iter(["to"]));
    }

    #[test]
    fn schema_takes_precedence_over_walker() {
        let registry = SchemaRegistry::new().with("listTabs", &["tabs.*.actor"]);
        let reply = json!({
            "tabs": [{"actor": "conn0.tab1"}, {"actor": "conn0.tab2"}],
            "consoleActor": "conn0.console3"
        });
        let refs = registry.actor_refs("listTabs", &reply, 32);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].key_path, KeyPath::new(vec!["tabs".into(), 1.into(), "actor".into()]));
        assert_eq!(registry.actor_refs("other", &reply, 32).len(), 3);
    }

    #[test]
    fn key_path_set_and_get() {
        let mut value = json!({"frames": [{"actor": "conn0.f1"}]});
        let path = KeyPath::new(vec!["frames".into(), 0.into(), "actor".into()]);
        assert_eq!(path.actor_in(&value), Some("conn0.f1"));
        assert!(path.set(&mut value, json!("conn1.f9")));
        assert_eq!(path.actor_in(&value), Some("conn1.f9"));
        assert!(!KeyPath::from_iter(["missing", "x"]).set(&mut value, json!(1)));
    }
}
