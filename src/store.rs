use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::node::{ArcStr, Node};

/// Called once per node during a bulk resolution pass. The returned fields
/// are merged into that node's resolved-field cache.
pub type NodeVisitor =
    dyn Fn(Arc<Node>) -> BoxFuture<'static, anyhow::Result<Map<String, Value>>> + Send + Sync;

/// The content store the node model reads from.
///
/// Node persistence and type indices live behind this trait, the node model
/// only ever looks nodes up and writes resolved fields back.
pub trait NodeStore: Send + Sync {
    fn get_node(&self, id: &str) -> Option<Arc<Node>>;

    /// Every node, in insertion order.
    fn get_nodes(&self) -> Vec<Arc<Node>>;

    fn get_nodes_by_type(&self, type_name: &str) -> Vec<Arc<Node>>;

    fn get_types(&self) -> Vec<String>;

    /// Passes every node of `type_names` through `visitor` and merges what it
    /// returns into the node. Completes once every node has been visited, and
    /// stops at the first failure.
    fn save_resolved_nodes<'a>(
        &'a self,
        type_names: &'a [String],
        visitor: &'a NodeVisitor,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            for type_name in type_names {
                for node in self.get_nodes_by_type(type_name) {
                    let resolved = visitor(node.clone()).await?;
                    node.merge_resolved(resolved);
                }
            }

            Ok(())
        })
    }
}

impl<T: NodeStore + ?Sized> NodeStore for Arc<T> {
    fn get_node(&self, id: &str) -> Option<Arc<Node>> {
        (**self).get_node(id)
    }

    fn get_nodes(&self) -> Vec<Arc<Node>> {
        (**self).get_nodes()
    }

    fn get_nodes_by_type(&self, type_name: &str) -> Vec<Arc<Node>> {
        (**self).get_nodes_by_type(type_name)
    }

    fn get_types(&self) -> Vec<String> {
        (**self).get_types()
    }

    fn save_resolved_nodes<'a>(
        &'a self,
        type_names: &'a [String],
        visitor: &'a NodeVisitor,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        (**self).save_resolved_nodes(type_names, visitor)
    }
}

#[derive(Default)]
struct Nodes {
    order: Vec<ArcStr>,
    by_id: HashMap<ArcStr, Arc<Node>>,
    by_type: HashMap<ArcStr, Vec<ArcStr>>,
}

/// A simple in-memory [`NodeStore`].
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<Nodes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects nodes into a new store.
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let store = Self::new();
        for node in nodes {
            store.add_node(node);
        }
        store
    }

    /// Inserts a node. A node with the same id is replaced, together with
    /// everything resolved on it.
    pub fn add_node(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        let id = ArcStr::from(node.id());
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);

        match nodes.by_id.insert(id.clone(), node.clone()) {
            Some(old) => {
                if old.type_name() != node.type_name() {
                    remove_from_type(&mut nodes.by_type, old.type_name(), &id);
                    push_to_type(&mut nodes.by_type, node.type_name(), id);
                }
            }
            None => {
                nodes.order.push(id.clone());
                push_to_type(&mut nodes.by_type, node.type_name(), id);
            }
        }

        node
    }

    pub fn delete_node(&self, id: &str) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let node = nodes.by_id.remove(id)?;

        nodes.order.retain(|other| other.as_ref() != id);
        remove_from_type(&mut nodes.by_type, node.type_name(), id);

        Some(node)
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push_to_type(by_type: &mut HashMap<ArcStr, Vec<ArcStr>>, type_name: &str, id: ArcStr) {
    by_type.entry(ArcStr::from(type_name)).or_default().push(id);
}

fn remove_from_type(by_type: &mut HashMap<ArcStr, Vec<ArcStr>>, type_name: &str, id: &str) {
    if let Some(ids) = by_type.get_mut(type_name) {
        ids.retain(|other| other.as_ref() != id);
        if ids.is_empty() {
            by_type.remove(type_name);
        }
    }
}

impl NodeStore for MemoryStore {
    fn get_node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(id)
            .cloned()
    }

    fn get_nodes(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);

        nodes
            .order
            .iter()
            .filter_map(|id| nodes.by_id.get(id).cloned())
            .collect()
    }

    fn get_nodes_by_type(&self, type_name: &str) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);

        match nodes.by_type.get(type_name) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| nodes.by_id.get(id).cloned())
                .collect(),
            None => vec![],
        }
    }

    fn get_types(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = nodes.by_type.keys().map(|name| name.to_string()).collect();
        types.sort_unstable();
        types
    }
}
