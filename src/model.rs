use std::sync::Arc;

use serde_json::Value;

use crate::batch::{self, PrepareQueue};
use crate::context::ContextualNodeModel;
use crate::determine::determine_resolvable_fields;
use crate::error::QueryError;
use crate::filter::{FilterArgs, FiltersCache, MemoryExecutor, QueryExecutor};
use crate::inline::RootNodeIndex;
use crate::node::Node;
use crate::planner::QueryArgs;
use crate::schema::{Schema, TypeKind};
use crate::shape::FieldShape;
use crate::store::NodeStore;
use crate::tracking::{self, DependencyLog, DependencySink, PageDependencies, Trackable};

/// Parent chains longer than this are assumed to be cycles.
const MAX_ANCESTOR_HOPS: usize = 100;

/// Where to start looking for a root node.
#[derive(Debug, Clone)]
pub enum Anchor<'a> {
    Node(Arc<Node>),
    /// A value borrowed from somewhere inside a node's data.
    Fragment(&'a Value),
}

/// Arguments of [`NodeModel::run_query`].
#[derive(Clone, Copy)]
pub struct RunQuery<'a> {
    /// The queried type, an object or an interface.
    pub type_name: &'a str,
    pub query: &'a QueryArgs,
    pub first_only: bool,
    pub filters_cache: Option<&'a FiltersCache>,
}

impl<'a> RunQuery<'a> {
    pub fn new(type_name: &'a str, query: &'a QueryArgs) -> Self {
        Self {
            type_name,
            query,
            first_only: false,
            filters_cache: None,
        }
    }

    pub fn first_only(mut self) -> Self {
        self.first_only = true;
        self
    }

    pub fn filters_cache(mut self, cache: &'a FiltersCache) -> Self {
        self.filters_cache = Some(cache);
        self
    }
}

/// Result of [`NodeModel::run_query`].
#[derive(Debug, Clone)]
pub enum QueryOutput {
    First(Option<Arc<Node>>),
    All(Vec<Arc<Node>>),
}

impl QueryOutput {
    pub fn into_first(self) -> Option<Arc<Node>> {
        match self {
            QueryOutput::First(node) => node,
            QueryOutput::All(nodes) => nodes.into_iter().next(),
        }
    }

    pub fn into_vec(self) -> Vec<Arc<Node>> {
        match self {
            QueryOutput::First(node) => node.into_iter().collect(),
            QueryOutput::All(nodes) => nodes,
        }
    }
}

impl Trackable for QueryOutput {
    fn for_each_node(&self, f: &mut dyn FnMut(&Node)) {
        match self {
            QueryOutput::First(node) => node.for_each_node(f),
            QueryOutput::All(nodes) => nodes.for_each_node(f),
        }
    }
}

/// Result of [`NodeModel::find_all`].
#[derive(Debug, Clone)]
pub struct FindAll {
    pub entries: Vec<Arc<Node>>,
    /// Number of matches before `skip` and `limit` were applied.
    pub total_count: usize,
}

struct Inner {
    store: Arc<dyn NodeStore>,
    schema: Arc<Schema>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn DependencySink>,
    root_nodes: RootNodeIndex,
    prepare: PrepareQueue,
}

/// The query engine over a node store.
///
/// Cheap to clone, every clone shares the same caches. Queries which need
/// fields resolved spawn their batch onto the current Tokio runtime, and fail
/// with [`QueryError::NoRuntime`] outside of one.
///
/// ```rust
/// use hauchiwa_query::{MemoryStore, Node, NodeModel, Schema, TypeDef};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.add_node(Node::from_value(json!({ "id": "1", "internal": { "type": "Post" } })).unwrap());
///
/// let model = NodeModel::builder()
///     .store(store)
///     .schema(Schema::builder().add_type(TypeDef::node("Post")).finish())
///     .finish()
///     .unwrap();
///
/// assert!(model.get_node_by_id("1", Some("Post"), &Default::default()).is_some());
/// ```
#[derive(Clone)]
pub struct NodeModel {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct NodeModelBuilder {
    store: Option<Arc<dyn NodeStore>>,
    schema: Option<Arc<Schema>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    sink: Option<Arc<dyn DependencySink>>,
}

impl NodeModelBuilder {
    pub fn store(mut self, store: impl NodeStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn schema(mut self, schema: impl Into<Arc<Schema>>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Replaces the default [`MemoryExecutor`].
    pub fn executor(mut self, executor: impl QueryExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Where dependency edges go. Without one they are collected by a
    /// [`DependencyLog`] nobody reads.
    pub fn sink(mut self, sink: impl DependencySink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn finish(self) -> Result<NodeModel, QueryError> {
        let store = self.store.ok_or(QueryError::Config("store"))?;
        let schema = self.schema.ok_or(QueryError::Config("schema"))?;

        Ok(NodeModel {
            inner: Arc::new(Inner {
                store,
                schema,
                executor: self.executor.unwrap_or_else(|| Arc::new(MemoryExecutor)),
                sink: self.sink.unwrap_or_else(|| Arc::new(DependencyLog::new())),
                root_nodes: RootNodeIndex::default(),
                prepare: PrepareQueue::default(),
            }),
        })
    }
}

impl NodeModel {
    pub fn builder() -> NodeModelBuilder {
        NodeModelBuilder::default()
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn store(&self) -> &dyn NodeStore {
        &*self.inner.store
    }

    pub(crate) fn root_nodes(&self) -> &RootNodeIndex {
        &self.inner.root_nodes
    }

    pub(crate) fn prepare_queue(&self) -> &PrepareQueue {
        &self.inner.prepare
    }

    /// A view of this model which records dependencies for `context` unless
    /// told otherwise.
    pub fn with_context(&self, context: PageDependencies) -> ContextualNodeModel {
        ContextualNodeModel::new(self.clone(), context)
    }

    /// Looks a node up by id. With `type_name`, the node also has to be of
    /// that type, or implement it.
    pub fn get_node_by_id(
        &self,
        id: &str,
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Option<Arc<Node>> {
        let node = self
            .store()
            .get_node(id)
            .filter(|node| self.is_of_type(node, type_name));

        if let Some(node) = &node {
            self.track_inline_objects_in_root_node(node);
        }

        self.track_page_dependencies(node, deps)
    }

    /// Looks up several nodes at once, skipping ids with no matching node.
    pub fn get_nodes_by_ids(
        &self,
        ids: &[&str],
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Vec<Arc<Node>> {
        let nodes: Vec<_> = ids
            .iter()
            .filter_map(|id| self.store().get_node(id))
            .filter(|node| self.is_of_type(node, type_name))
            .collect();

        for node in &nodes {
            self.track_inline_objects_in_root_node(node);
        }

        self.track_page_dependencies(nodes, deps)
    }

    /// Every node of a type, or every node in the store.
    ///
    /// Asking for a type makes the consumer depend on the whole connection,
    /// so any node of that type appearing or disappearing invalidates it.
    pub fn get_all_nodes(
        &self,
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Vec<Arc<Node>> {
        let nodes = match type_name {
            Some(type_name) => self
                .schema()
                .node_type_names(type_name)
                .iter()
                .flat_map(|name| self.store().get_nodes_by_type(name))
                .collect(),
            None => self.store().get_nodes(),
        };

        for node in &nodes {
            self.track_inline_objects_in_root_node(node);
        }

        let deps = match type_name {
            Some(type_name) if deps.connection_type.is_none() => deps.clone().connection(type_name),
            _ => deps.clone(),
        };

        self.track_page_dependencies(nodes, &deps)
    }

    pub fn get_types(&self) -> Vec<String> {
        self.store().get_types()
    }

    /// Runs a declarative query against a node type.
    ///
    /// Fields the query touches that need a resolver are resolved first, in
    /// a batch shared with concurrent queries for the same type. Filtering,
    /// sorting and pagination happen in the configured [`QueryExecutor`].
    pub async fn run_query(
        &self,
        args: RunQuery<'_>,
        deps: &PageDependencies,
    ) -> Result<QueryOutput, QueryError> {
        let RunQuery {
            type_name,
            query,
            first_only,
            filters_cache,
        } = args;

        let def = self
            .schema()
            .get(type_name)
            .ok_or_else(|| QueryError::UnknownType(type_name.to_string()))?;

        if let TypeKind::Union { .. } = def.kind {
            return Err(QueryError::UnionNotSupported(type_name.to_string()));
        }

        let node_type_names = self.schema().node_type_names(type_name);
        let query_fields = query.query_fields()?;
        let fields_to_resolve =
            determine_resolvable_fields(self.schema(), type_name, &query_fields, &node_type_names);

        if !fields_to_resolve.is_empty() {
            self.prepare_nodes(type_name, query_fields, fields_to_resolve)
                .await?;
        }

        let nodes = self
            .inner
            .executor
            .run(FilterArgs {
                query,
                first_only,
                node_type_names: &node_type_names,
                store: self.store(),
                cache: filters_cache,
            })
            .map_err(QueryError::Filter)?;

        let output = match first_only {
            true => QueryOutput::First(nodes.into_iter().next()),
            false => QueryOutput::All(nodes),
        };

        match &output {
            QueryOutput::First(node) => node.iter().for_each(|node| {
                self.track_inline_objects_in_root_node(node);
            }),
            QueryOutput::All(nodes) => nodes.iter().for_each(|node| {
                self.track_inline_objects_in_root_node(node);
            }),
        }

        Ok(self.track_page_dependencies(output, deps))
    }

    /// The first node matching `query`, if any.
    pub async fn find_one(
        &self,
        type_name: &str,
        query: &QueryArgs,
        deps: &PageDependencies,
    ) -> Result<Option<Arc<Node>>, QueryError> {
        let output = self
            .run_query(RunQuery::new(type_name, query).first_only(), deps)
            .await?;

        Ok(output.into_first())
    }

    /// Every node matching `query`, along with the match count before
    /// pagination. The consumer depends on the whole connection.
    pub async fn find_all(
        &self,
        type_name: &str,
        query: &QueryArgs,
        deps: &PageDependencies,
    ) -> Result<FindAll, QueryError> {
        let deps = match deps.connection_type {
            Some(_) => deps.clone(),
            None => deps.clone().connection(type_name),
        };

        let unpaged = QueryArgs {
            skip: None,
            limit: None,
            ..query.clone()
        };

        let matches = self
            .run_query(RunQuery::new(type_name, &unpaged), &deps)
            .await?
            .into_vec();

        let total_count = matches.len();
        let entries = matches.into_iter().skip(query.skip.unwrap_or(0));
        let entries = match query.limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        };

        Ok(FindAll {
            entries,
            total_count,
        })
    }

    /// Reads a dotted field path off a node, resolving it first if needed.
    /// Arrays along the path are mapped over.
    pub async fn get_field_value(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<Option<Value>, QueryError> {
        let fields = FieldShape::from_path(path);
        self.prepare_nodes(node.type_name(), fields.clone(), fields)
            .await?;

        // The store may hold a newer allocation than the caller.
        let node = self.store().get_node(node.id());
        let value = match node {
            Some(node) => node.to_resolved_value(),
            None => return Ok(None),
        };

        let segments: Vec<_> = path.split('.').collect();
        Ok(value_at(&value, &segments))
    }

    /// Makes sure `fields_to_resolve` is present in the resolved-field cache
    /// of every node of `type_name`.
    pub async fn prepare_nodes(
        &self,
        type_name: &str,
        query_fields: FieldShape,
        fields_to_resolve: FieldShape,
    ) -> Result<(), QueryError> {
        batch::prepare_nodes(self, type_name, query_fields, fields_to_resolve).await
    }

    /// Records the dependency edges `result` implies and hands it back
    /// unchanged.
    pub fn track_page_dependencies<R: Trackable>(&self, result: R, deps: &PageDependencies) -> R {
        tracking::track_page_dependencies(&*self.inner.sink, &result, deps);
        result
    }

    /// Indexes the nested values of `node`, so they can be traced back to
    /// it later. Returns `false` if the node was already indexed.
    pub fn track_inline_objects_in_root_node(&self, node: &Arc<Node>) -> bool {
        self.root_nodes().track(node)
    }

    /// Walks up from `anchor` to the node holding it, then through declared
    /// parents, returning the first node `predicate` accepts, or the topmost
    /// node when there is no predicate.
    ///
    /// A fragment is traced through the root-node index, so it has to be
    /// borrowed from a node this model has already handed out. Nodes are
    /// never nested in one another, so past the first step only the
    /// `parent` link leads anywhere.
    pub fn find_root_node_ancestor(
        &self,
        anchor: Anchor<'_>,
        predicate: Option<&dyn Fn(&Node) -> bool>,
    ) -> Option<Arc<Node>> {
        let mut current = match anchor {
            Anchor::Node(node) => node,
            Anchor::Fragment(value) => self.root_nodes().root_of(value)?,
        };

        for _ in 0..MAX_ANCESTOR_HOPS {
            if predicate.is_some_and(|predicate| predicate(&current)) {
                return Some(current);
            }

            let parent = current.parent().and_then(|id| self.store().get_node(id));

            match parent {
                Some(next) => current = next,
                None => {
                    let accepted = predicate.is_none_or(|predicate| predicate(&current));
                    return accepted.then_some(current);
                }
            }
        }

        tracing::error!(
            "Node '{}' looks like it has itself as an ancestor. \
             Check the 'parent' field of the nodes it descends from.",
            current.id()
        );

        None
    }

    /// Drops root-node index entries whose node no longer exists, returning
    /// how many were removed.
    pub fn sweep_root_nodes(&self) -> usize {
        self.root_nodes().sweep()
    }

    fn is_of_type(&self, node: &Node, type_name: Option<&str>) -> bool {
        match type_name {
            Some(type_name) => self
                .schema()
                .node_type_names(type_name)
                .iter()
                .any(|name| name == node.type_name()),
            None => true,
        }
    }
}

fn value_at(value: &Value, path: &[&str]) -> Option<Value> {
    let Some((first, rest)) = path.split_first() else {
        return Some(value.clone()).filter(|value| !value.is_null());
    };

    match value {
        Value::Object(map) => value_at(map.get(*first)?, rest),
        Value::Array(items) => {
            let mut values = vec![];
            for item in items {
                match value_at(item, path) {
                    Some(Value::Array(inner)) => values.extend(inner),
                    Some(value) => values.push(value),
                    None => {}
                }
            }
            Some(Value::Array(values))
        }
        _ => None,
    }
}
