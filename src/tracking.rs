use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::node::Node;

/// What a page depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyTarget {
    /// A single node, by id.
    Node(String),
    /// Every node of a type. Adding or removing any of them invalidates the
    /// page.
    Connection(String),
}

/// A dependency edge from a consuming page to node data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageDependency {
    pub path: Utf8PathBuf,
    pub target: DependencyTarget,
}

impl PageDependency {
    pub fn node(path: impl Into<Utf8PathBuf>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: DependencyTarget::Node(id.into()),
        }
    }

    pub fn connection(path: impl Into<Utf8PathBuf>, type_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: DependencyTarget::Connection(type_name.into()),
        }
    }
}

/// Receives dependency edges, write-only. Whatever invalidates pages on
/// data changes sits behind this trait.
pub trait DependencySink: Send + Sync {
    fn create_page_dependency(&self, dependency: PageDependency);
}

impl<T: DependencySink + ?Sized> DependencySink for Arc<T> {
    fn create_page_dependency(&self, dependency: PageDependency) {
        (**self).create_page_dependency(dependency)
    }
}

/// A [`DependencySink`] which simply collects every edge in memory.
#[derive(Debug, Default)]
pub struct DependencyLog {
    edges: Mutex<Vec<PageDependency>>,
}

impl DependencyLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all edges recorded so far.
    pub fn edges(&self) -> Vec<PageDependency> {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns all edges recorded so far.
    pub fn take(&self) -> Vec<PageDependency> {
        std::mem::take(&mut *self.edges.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl DependencySink for DependencyLog {
    fn create_page_dependency(&self, dependency: PageDependency) {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dependency);
    }
}

/// The consumer a call is made on behalf of.
///
/// Without a `path` nothing is tracked. With a `connection_type` a single
/// connection-level edge is recorded instead of one edge per node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageDependencies {
    pub path: Option<Utf8PathBuf>,
    pub connection_type: Option<String>,
    /// `Some(false)` disables tracking for this call.
    pub track: Option<bool>,
}

impl PageDependencies {
    pub fn path(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn connection(mut self, type_name: impl Into<String>) -> Self {
        self.connection_type = Some(type_name.into());
        self
    }

    pub fn untracked(mut self) -> Self {
        self.track = Some(false);
        self
    }

    /// Layers `self` over `base`: keys set here win.
    pub fn over(&self, base: &PageDependencies) -> PageDependencies {
        PageDependencies {
            path: self.path.clone().or_else(|| base.path.clone()),
            connection_type: self
                .connection_type
                .clone()
                .or_else(|| base.connection_type.clone()),
            track: self.track.or(base.track),
        }
    }

    fn tracked_path(&self) -> Option<&Utf8Path> {
        match self.track {
            Some(false) => None,
            _ => self.path.as_deref(),
        }
    }
}

/// Anything a query can return: a node, an optional node, or lists of them.
pub trait Trackable {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node));
}

impl Trackable for Node {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        f(self)
    }
}

impl<T: Trackable + ?Sized> Trackable for Arc<T> {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        (**self).for_each_node(f)
    }
}

impl<T: Trackable + ?Sized> Trackable for &T {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        (**self).for_each_node(f)
    }
}

impl<T: Trackable> Trackable for Option<T> {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        if let Some(inner) = self {
            inner.for_each_node(f)
        }
    }
}

impl<T: Trackable> Trackable for [T] {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        for item in self {
            item.for_each_node(f)
        }
    }
}

impl<T: Trackable> Trackable for Vec<T> {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        self.as_slice().for_each_node(f)
    }
}

/// Records the edges `result` implies for `context`. `null` entries are
/// skipped, the result itself is never touched.
pub(crate) fn track_page_dependencies<R>(
    sink: &dyn DependencySink,
    result: &R,
    context: &PageDependencies,
) where
    R: Trackable + ?Sized,
{
    let Some(path) = context.tracked_path() else {
        return;
    };

    if let Some(connection) = &context.connection_type {
        sink.create_page_dependency(PageDependency::connection(path, connection.as_str()));
        return;
    }

    result.for_each_node(&mut |node| {
        sink.create_page_dependency(PageDependency::node(path, node.id()));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> Arc<Node> {
        Arc::new(Node::from_value(json!({ "id": id, "internal": { "type": "Post" } })).unwrap())
    }

    #[test]
    fn test_no_path_is_noop() {
        let log = DependencyLog::new();
        track_page_dependencies(&log, &vec![node("1")], &PageDependencies::default());
        assert!(log.edges().is_empty());
    }

    #[test]
    fn test_node_edges_skip_nulls() {
        let log = DependencyLog::new();
        let result = vec![Some(node("1")), None, Some(node("2"))];
        track_page_dependencies(&log, &result, &PageDependencies::path("/blog"));

        assert_eq!(
            log.take(),
            vec![
                PageDependency::node("/blog", "1"),
                PageDependency::node("/blog", "2"),
            ]
        );
        assert!(log.edges().is_empty());
    }

    #[test]
    fn test_connection_edge() {
        let log = DependencyLog::new();
        let result = vec![node("1"), node("2"), node("3")];
        let context = PageDependencies::path("/blog").connection("Post");
        track_page_dependencies(&log, &result, &context);

        assert_eq!(log.edges(), vec![PageDependency::connection("/blog", "Post")]);
    }

    #[test]
    fn test_untracked() {
        let log = DependencyLog::new();
        let context = PageDependencies::path("/blog").untracked();
        track_page_dependencies(&log, &node("1"), &context);
        assert!(log.edges().is_empty());
    }

    #[test]
    fn test_context_layering() {
        let base = PageDependencies::path("/base").connection("Post");
        let call = PageDependencies::path("/call");
        let merged = call.over(&base);

        assert_eq!(merged.path.as_deref(), Some(Utf8Path::new("/call")));
        assert_eq!(merged.connection_type.as_deref(), Some("Post"));
        assert_eq!(merged.track, None);
    }
}
