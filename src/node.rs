use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};

use crate::error::{NodeError, ShapeError};
use crate::shape::FieldShape;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// The key under which a node keeps its own bookkeeping (type name, owner,
/// content digest). It is never treated as user data.
pub(crate) const INTERNAL: &str = "internal";

/// A 32-byte BLAKE3 hash used as an opaque handle for JSON values, such as
/// the filters a query cache is keyed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Fingerprint of a JSON value. Object keys are kept sorted by
    /// `serde_json`, so equal values always hash equal.
    pub(crate) fn of_json(value: &Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Writing into a hasher cannot fail, serialisation of a `Value` neither.
        let _ = serde_json::to_writer(HashWriter(&mut hasher), value);
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

struct HashWriter<'a>(&'a mut blake3::Hasher);

impl std::io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A typed record in the content graph.
///
/// Nodes are created by the content store and are immutable by convention,
/// with one exception: the resolved-field cache. Every field computed by a
/// registered resolver is merged into it, and it only ever grows. Next to
/// it the node remembers the shape of everything resolved so far, so a
/// replaced node starts over with nothing resolved.
///
/// A node is built from a JSON object that carries at least an `id` and an
/// `internal.type`:
///
/// ```rust
/// use hauchiwa_query::Node;
/// use serde_json::json;
///
/// let node = Node::from_value(json!({
///     "id": "1",
///     "parent": null,
///     "internal": { "type": "Post" },
///     "title": "Hello",
/// }))
/// .unwrap();
///
/// assert_eq!(node.id(), "1");
/// assert_eq!(node.type_name(), "Post");
/// ```
pub struct Node {
    id: ArcStr,
    type_name: ArcStr,
    parent: Option<ArcStr>,
    data: Map<String, Value>,
    resolved: Mutex<Resolved>,
}

#[derive(Default)]
struct Resolved {
    fields: Map<String, Value>,
    /// Everything resolvers have run for, including fields which resolved
    /// to nothing.
    shape: FieldShape,
}

impl Node {
    pub fn from_value(value: Value) -> Result<Self, NodeError> {
        let data = match value {
            Value::Object(map) => map,
            _ => return Err(NodeError::NotAnObject),
        };

        let id = match data.get("id") {
            Some(Value::String(id)) => ArcStr::from(id.as_str()),
            _ => return Err(NodeError::MissingId),
        };

        let type_name = match data.get(INTERNAL).and_then(|i| i.get("type")) {
            Some(Value::String(name)) => ArcStr::from(name.as_str()),
            _ => return Err(NodeError::MissingType(id.to_string())),
        };

        let parent = match data.get("parent") {
            Some(Value::String(parent)) => Some(ArcStr::from(parent.as_str())),
            Some(Value::Null) | None => None,
            Some(_) => return Err(NodeError::InvalidParent(id.to_string())),
        };

        Ok(Self {
            id,
            type_name,
            parent,
            data,
            resolved: Mutex::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Plain stored data, including `id`, `parent` and `internal`.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Plain property read, ignoring anything resolved.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Reads a field, preferring the resolved value over the stored one.
    pub fn field(&self, field: &str) -> Option<Value> {
        let resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);

        resolved
            .fields
            .get(field)
            .or_else(|| self.data.get(field))
            .cloned()
    }

    /// A snapshot of the resolved-field cache.
    pub fn resolved(&self) -> Map<String, Value> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fields
            .clone()
    }

    /// The part of `fields` which hasn't been resolved on this node yet.
    pub(crate) fn owed(&self, fields: &FieldShape) -> FieldShape {
        let resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        fields.difference(&resolved.shape)
    }

    /// Records that resolvers have run for `fields` on this node.
    pub(crate) fn mark_resolved(&self, fields: &FieldShape) -> Result<(), ShapeError> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shape
            .merge(fields)
    }

    /// The node as a JSON value, as seen by field resolvers.
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// The node with its resolved fields layered over the stored ones. This is
    /// what filters, sorts and field paths are evaluated against.
    pub fn to_resolved_value(&self) -> Value {
        let mut value = self.to_value();
        deep_merge(&mut value, Value::Object(self.resolved()));
        value
    }

    /// Deep-merges freshly resolved fields into the cache. Objects are merged
    /// key by key, everything else is replaced. Stores call this when they
    /// persist the output of a resolution pass.
    pub fn merge_resolved(&self, fields: Map<String, Value>) {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);

        for (key, value) in fields {
            match resolved.fields.get_mut(&key) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    resolved.fields.insert(key, value);
                }
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

pub(crate) fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value() {
        let node = Node::from_value(json!({
            "id": "1",
            "parent": "0",
            "internal": { "type": "Post" },
            "title": "A",
        }))
        .unwrap();

        assert_eq!(node.id(), "1");
        assert_eq!(node.parent(), Some("0"));
        assert_eq!(node.type_name(), "Post");
        assert_eq!(node.get("title"), Some(&json!("A")));
    }

    #[test]
    fn test_from_value_rejects_missing_type() {
        let err = Node::from_value(json!({ "id": "1" })).unwrap_err();
        assert!(matches!(err, NodeError::MissingType(id) if id == "1"));

        let err = Node::from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, NodeError::NotAnObject));
    }

    #[test]
    fn test_merge_resolved_only_grows() {
        let node = Node::from_value(json!({
            "id": "1",
            "internal": { "type": "Post" },
            "title": "A",
        }))
        .unwrap();

        let first = json!({ "meta": { "a": 1 } });
        let second = json!({ "meta": { "b": 2 }, "slug": "/a" });
        node.merge_resolved(first.as_object().unwrap().clone());
        node.merge_resolved(second.as_object().unwrap().clone());

        assert_eq!(
            Value::Object(node.resolved()),
            json!({ "meta": { "a": 1, "b": 2 }, "slug": "/a" })
        );
        assert_eq!(node.field("slug"), Some(json!("/a")));
        assert_eq!(node.field("title"), Some(json!("A")));
        assert_eq!(node.to_resolved_value()["meta"], json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_owed_fields() {
        let node = Node::from_value(json!({ "id": "1", "internal": { "type": "Post" } })).unwrap();
        let slug = FieldShape::new().with_leaf("slug");
        let both = slug.clone().with_leaf("date");

        assert_eq!(node.owed(&both), both);
        node.mark_resolved(&slug).unwrap();
        assert_eq!(node.owed(&both), FieldShape::new().with_leaf("date"));
        assert!(node.owed(&slug).is_empty());

        let nested = FieldShape::new().with_nested("slug", FieldShape::new().with_leaf("x"));
        assert!(node.mark_resolved(&nested).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = json!({ "x": 1, "y": [1, 2] });
        let b = json!({ "y": [1, 2], "x": 1 });
        assert_eq!(Hash32::of_json(&a), Hash32::of_json(&b));
        assert_ne!(Hash32::of_json(&a), Hash32::of_json(&json!({ "x": 2 })));
        assert_eq!(Hash32::of_json(&a).to_hex().len(), 64);
    }
}
