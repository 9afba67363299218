use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use crate::node::{ArcStr, INTERNAL, Node};

/// Address of a value stored inside a node.
///
/// Node data is never mutated once the node is shared, so the address of a
/// nested value stays put for as long as its node is alive. A dead node's
/// addresses may be reused, which is why every entry is checked against its
/// weak owner before use.
type Handle = usize;

fn handle(value: &Value) -> Handle {
    std::ptr::from_ref(value) as Handle
}

#[derive(Default)]
struct IndexState {
    /// Nested object or array → the node that contains it.
    roots: HashMap<Handle, Weak<Node>>,
    /// Nodes already scanned, by id. A node replaced under the same id is a
    /// different allocation and gets scanned again.
    tracked: HashMap<ArcStr, Weak<Node>>,
}

/// Weak index from nested values back to the root node owning them.
///
/// A query may hand out a fragment of a node (`post.frontmatter.author`)
/// rather than the node itself. This index lets the ancestor lookup find the
/// node such a fragment was borrowed from. Entries only hold weak
/// references, so they never keep a node alive and are ignored once the
/// node is gone.
#[derive(Default)]
pub(crate) struct RootNodeIndex {
    state: Mutex<IndexState>,
}

impl RootNodeIndex {
    /// Records every nested container reachable from `node`, skipping its
    /// `internal` metadata. Returns `false` if the node was already scanned.
    pub(crate) fn track(&self, node: &Arc<Node>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(seen) = state.tracked.get(node.id())
            && std::ptr::eq(seen.as_ptr(), Arc::as_ptr(node))
        {
            return false;
        }

        let owner = Arc::downgrade(node);
        let mut visited = HashSet::new();

        for (key, value) in node.data() {
            if key == INTERNAL {
                continue;
            }
            walk(value, &owner, &mut state.roots, &mut visited);
        }

        state.tracked.insert(ArcStr::from(node.id()), owner);
        true
    }

    /// The live node `value` is stored in, if it was borrowed from an
    /// indexed node. Copies of a fragment are not found.
    pub(crate) fn root_of(&self, value: &Value) -> Option<Arc<Node>> {
        if !is_container(value) {
            return None;
        }

        let key = handle(value);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let owner = state.roots.get(&key)?.upgrade();

        if owner.is_none() {
            state.roots.remove(&key);
        }

        owner
    }

    /// Drops every entry whose node no longer exists. Returns how many
    /// entries were removed.
    pub(crate) fn sweep(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.roots.len() + state.tracked.len();

        state.roots.retain(|_, owner| owner.strong_count() > 0);
        state.tracked.retain(|_, owner| owner.strong_count() > 0);

        before - state.roots.len() - state.tracked.len()
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.roots.len(), state.tracked.len())
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

/// Depth-first walk over nested containers. A container seen earlier in
/// the same scan is not walked again.
fn walk(
    value: &Value,
    owner: &Weak<Node>,
    roots: &mut HashMap<Handle, Weak<Node>>,
    visited: &mut HashSet<Handle>,
) {
    if !is_container(value) {
        return;
    }

    let key = handle(value);
    if !visited.insert(key) {
        return;
    }

    // Any previous entry at this address belonged to a node which is gone.
    roots.insert(key, owner.clone());

    match value {
        Value::Object(map) => {
            for child in map.values() {
                walk(child, owner, roots, visited);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, owner, roots, visited);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str) -> Arc<Node> {
        Arc::new(
            Node::from_value(json!({
                "id": id,
                "internal": { "type": "Post", "owner": "fs" },
                "frontmatter": {
                    "title": "A",
                    "authors": [{ "name": "Ann" }, { "name": "Bob" }],
                },
                "empty": {},
            }))
            .unwrap(),
        )
    }

    fn bob(node: &Node) -> &Value {
        &node.get("frontmatter").unwrap()["authors"][1]
    }

    #[test]
    fn test_track_is_idempotent() {
        let index = RootNodeIndex::default();
        let node = post("1");

        assert!(index.track(&node));
        let once = index.len();
        assert!(!index.track(&node));
        assert_eq!(index.len(), once);

        // frontmatter, authors, the two author objects, and the empty object
        assert_eq!(once, (5, 1));
    }

    #[test]
    fn test_root_of_nested_fragment() {
        let index = RootNodeIndex::default();
        let node = post("1");
        index.track(&node);

        let found = index.root_of(bob(&node)).unwrap();
        assert_eq!(found.id(), "1");

        let internal = node.get("internal").unwrap();
        assert!(index.root_of(internal).is_none());
        assert!(index.root_of(&json!({ "name": "Bob" })).is_none());
        assert!(index.root_of(&node.get("frontmatter").unwrap()["title"]).is_none());
    }

    #[test]
    fn test_equal_fragments_keep_their_own_node() {
        let index = RootNodeIndex::default();
        let first = post("1");
        let second = post("2");
        index.track(&first);
        index.track(&second);

        assert_eq!(index.root_of(bob(&first)).unwrap().id(), "1");
        assert_eq!(index.root_of(bob(&second)).unwrap().id(), "2");
        assert_eq!(index.len(), (10, 2));
    }

    #[test]
    fn test_entries_do_not_keep_nodes_alive() {
        let index = RootNodeIndex::default();
        let node = post("1");
        index.track(&node);

        let weak = Arc::downgrade(&node);
        drop(node);
        assert!(weak.upgrade().is_none());

        assert_eq!(index.sweep(), 6);
        assert_eq!(index.len(), (0, 0));
    }

    #[test]
    fn test_replaced_node_is_rescanned() {
        let index = RootNodeIndex::default();
        let first = post("1");
        assert!(index.track(&first));

        let second = post("1");
        assert!(index.track(&second));
        assert_eq!(index.root_of(bob(&second)).unwrap().id(), "1");
        assert!(Arc::ptr_eq(&index.root_of(bob(&first)).unwrap(), &first));
    }
}
