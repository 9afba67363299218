use std::sync::Arc;

use serde_json::Value;

use crate::error::QueryError;
use crate::model::{Anchor, FindAll, NodeModel, QueryOutput, RunQuery};
use crate::node::Node;
use crate::planner::QueryArgs;
use crate::shape::FieldShape;
use crate::tracking::{PageDependencies, Trackable};

/// A [`NodeModel`] bound to a consumer.
///
/// Every call records its dependencies against the bound context, with
/// whatever the caller passes layered on top. Calling
/// [`with_context`](Self::with_context) again narrows the context further.
#[derive(Clone)]
pub struct ContextualNodeModel {
    model: NodeModel,
    context: PageDependencies,
}

impl ContextualNodeModel {
    pub(crate) fn new(model: NodeModel, context: PageDependencies) -> Self {
        Self { model, context }
    }

    pub fn model(&self) -> &NodeModel {
        &self.model
    }

    pub fn context(&self) -> &PageDependencies {
        &self.context
    }

    pub fn with_context(&self, context: PageDependencies) -> ContextualNodeModel {
        Self::new(self.model.clone(), context.over(&self.context))
    }

    fn deps(&self, deps: &PageDependencies) -> PageDependencies {
        deps.over(&self.context)
    }

    pub fn get_node_by_id(
        &self,
        id: &str,
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Option<Arc<Node>> {
        self.model.get_node_by_id(id, type_name, &self.deps(deps))
    }

    pub fn get_nodes_by_ids(
        &self,
        ids: &[&str],
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Vec<Arc<Node>> {
        self.model.get_nodes_by_ids(ids, type_name, &self.deps(deps))
    }

    pub fn get_all_nodes(
        &self,
        type_name: Option<&str>,
        deps: &PageDependencies,
    ) -> Vec<Arc<Node>> {
        self.model.get_all_nodes(type_name, &self.deps(deps))
    }

    pub fn get_types(&self) -> Vec<String> {
        self.model.get_types()
    }

    pub async fn run_query(
        &self,
        args: RunQuery<'_>,
        deps: &PageDependencies,
    ) -> Result<QueryOutput, QueryError> {
        self.model.run_query(args, &self.deps(deps)).await
    }

    pub async fn find_one(
        &self,
        type_name: &str,
        query: &QueryArgs,
        deps: &PageDependencies,
    ) -> Result<Option<Arc<Node>>, QueryError> {
        self.model.find_one(type_name, query, &self.deps(deps)).await
    }

    pub async fn find_all(
        &self,
        type_name: &str,
        query: &QueryArgs,
        deps: &PageDependencies,
    ) -> Result<FindAll, QueryError> {
        self.model.find_all(type_name, query, &self.deps(deps)).await
    }

    pub async fn get_field_value(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<Option<Value>, QueryError> {
        self.model.get_field_value(node, path).await
    }

    pub async fn prepare_nodes(
        &self,
        type_name: &str,
        query_fields: FieldShape,
        fields_to_resolve: FieldShape,
    ) -> Result<(), QueryError> {
        self.model
            .prepare_nodes(type_name, query_fields, fields_to_resolve)
            .await
    }

    pub fn track_page_dependencies<R: Trackable>(&self, result: R, deps: &PageDependencies) -> R {
        self.model.track_page_dependencies(result, &self.deps(deps))
    }

    pub fn track_inline_objects_in_root_node(&self, node: &Arc<Node>) -> bool {
        self.model.track_inline_objects_in_root_node(node)
    }

    pub fn find_root_node_ancestor(
        &self,
        anchor: Anchor<'_>,
        predicate: Option<&dyn Fn(&Node) -> bool>,
    ) -> Option<Arc<Node>> {
        self.model.find_root_node_ancestor(anchor, predicate)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use serde_json::json;

    use super::*;
    use crate::schema::{Schema, TypeDef};
    use crate::store::MemoryStore;
    use crate::tracking::{DependencyLog, PageDependency};

    fn setup() -> (NodeModel, Arc<DependencyLog>) {
        let store = MemoryStore::with_nodes(["1", "2"].into_iter().map(|id| {
            Node::from_value(json!({ "id": id, "internal": { "type": "Post" }, "title": id }))
                .unwrap()
        }));
        let log = Arc::new(DependencyLog::new());
        let model = NodeModel::builder()
            .store(store)
            .schema(Schema::builder().add_type(TypeDef::node("Post")).finish())
            .sink(log.clone())
            .finish()
            .unwrap();

        (model, log)
    }

    #[test]
    fn test_bound_context_is_used() {
        let (model, log) = setup();
        let view = model.with_context(PageDependencies::path("/a"));

        view.get_node_by_id("1", None, &PageDependencies::default());
        assert_eq!(log.take(), vec![PageDependency::node("/a", "1")]);
    }

    #[test]
    fn test_caller_keys_win() {
        let (model, log) = setup();
        let view = model.with_context(PageDependencies::path("/a"));

        view.get_node_by_id("1", None, &PageDependencies::path("/b"));
        assert_eq!(log.take(), vec![PageDependency::node("/b", "1")]);

        view.get_node_by_id("1", None, &PageDependencies::default().untracked());
        assert!(log.take().is_empty());
    }

    #[test]
    fn test_nested_contexts_accumulate() {
        let (model, log) = setup();
        let outer = model.with_context(PageDependencies::path("/a"));
        let inner = outer.with_context(PageDependencies::default().connection("Post"));

        assert_eq!(inner.context().path.as_deref(), Some(Utf8Path::new("/a")));
        inner.get_nodes_by_ids(&["1", "2"], None, &PageDependencies::default());
        assert_eq!(log.take(), vec![PageDependency::connection("/a", "Post")]);

        let innermost = inner.with_context(PageDependencies::path("/c"));
        innermost.get_node_by_id("2", None, &PageDependencies::default());
        assert_eq!(log.take(), vec![PageDependency::connection("/c", "Post")]);
    }

    #[tokio::test]
    async fn test_find_all_through_view() {
        let (model, log) = setup();
        let view = model.with_context(PageDependencies::path("/list"));

        let result = view
            .find_all("Post", &QueryArgs::default(), &PageDependencies::default())
            .await
            .unwrap();

        assert_eq!(result.total_count, 2);
        assert_eq!(log.take(), vec![PageDependency::connection("/list", "Post")]);
    }
}
