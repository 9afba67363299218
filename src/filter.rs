use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail};
use serde_json::{Map, Value, json};

use crate::node::{ArcStr, Hash32, Node};
use crate::planner::{ELEM_MATCH, QueryArgs, SortOrder};
use crate::store::NodeStore;

/// Everything the filter engine gets to see for one query.
pub struct FilterArgs<'a> {
    pub query: &'a QueryArgs,
    pub first_only: bool,
    /// Concrete node types to pick candidates from.
    pub node_type_names: &'a [String],
    pub store: &'a dyn NodeStore,
    pub cache: Option<&'a FiltersCache>,
}

/// Turns a prepared node set into the result of a query: filtering, sorting,
/// and pagination.
pub trait QueryExecutor: Send + Sync {
    fn run(&self, args: FilterArgs<'_>) -> anyhow::Result<Vec<Arc<Node>>>;
}

/// Memoized filter results, keyed by the type set and filter. The caller
/// decides how long a cache lives, usually one query-running session.
#[derive(Debug, Default)]
pub struct FiltersCache {
    entries: Mutex<HashMap<Hash32, Vec<ArcStr>>>,
}

impl FiltersCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &Hash32) -> Option<Vec<ArcStr>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn insert(&self, key: Hash32, ids: Vec<ArcStr>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, ids);
    }
}

/// Reference [`QueryExecutor`] scanning nodes in memory.
///
/// Supports the `eq`, `ne`, `in`, `nin`, `gt`, `gte`, `lt`, `lte`, `glob`
/// and `elemMatch` operators. Array-valued fields match if any element
/// does. Grouping, `distinct` and aggregates produce something other than a
/// node list, and are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryExecutor;

impl QueryExecutor for MemoryExecutor {
    fn run(&self, args: FilterArgs<'_>) -> anyhow::Result<Vec<Arc<Node>>> {
        let query = args.query;
        let unsupported = [
            ("group", query.group.is_some()),
            ("distinct", query.distinct.is_some()),
            ("max", query.max.is_some()),
            ("min", query.min.is_some()),
            ("sum", query.sum.is_some()),
        ];
        if let Some((name, _)) = unsupported.iter().find(|(_, present)| *present) {
            bail!("Query argument '{name}' is not supported by the in-memory executor");
        }

        let filter = query.filter.as_ref().filter(|filter| !filter.is_empty());
        let skip = query.skip.unwrap_or(0);
        let limit = match args.first_only {
            true => Some(1),
            false => query.limit,
        };

        // Unsorted, nothing past the requested page matters.
        let wanted = match &query.sort {
            Some(_) => None,
            None => limit.map(|limit| skip + limit),
        };

        let mut matched: Vec<(Arc<Node>, Value)> = match (filter, args.cache) {
            (Some(filter), Some(cache)) => {
                let key = Hash32::of_json(&json!({
                    "types": args.node_type_names,
                    "filter": filter,
                }));

                match cache.get(&key) {
                    Some(ids) => ids
                        .iter()
                        .filter_map(|id| args.store.get_node(id))
                        .map(|node| {
                            let view = node.to_resolved_value();
                            (node, view)
                        })
                        .collect(),
                    None => {
                        let matched = filter_nodes(&args, filter, None)?;
                        let ids = matched.iter().map(|(node, _)| ArcStr::from(node.id()));
                        cache.insert(key, ids.collect());
                        matched
                    }
                }
            }
            (Some(filter), None) => filter_nodes(&args, filter, wanted)?,
            (None, _) => candidates(&args)
                .take(wanted.unwrap_or(usize::MAX))
                .map(|node| {
                    let view = node.to_resolved_value();
                    (node, view)
                })
                .collect(),
        };

        if let Some(sort) = &query.sort {
            let orders = (0..sort.fields.len())
                .map(|i| sort.order.get(i).copied().unwrap_or_default())
                .collect::<Vec<_>>();

            matched.sort_by(|(_, a), (_, b)| {
                sort.fields
                    .iter()
                    .zip(&orders)
                    .map(|(path, order)| compare_sort(lookup(a, path), lookup(b, path), *order))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        let nodes = matched.into_iter().map(|(node, _)| node).skip(skip);

        Ok(match limit {
            Some(limit) => nodes.take(limit).collect(),
            None => nodes.collect(),
        })
    }
}

fn candidates<'a>(args: &'a FilterArgs<'_>) -> impl Iterator<Item = Arc<Node>> + 'a {
    args.node_type_names
        .iter()
        .flat_map(|type_name| args.store.get_nodes_by_type(type_name))
}

/// Matching candidates, in store order. Stops after `wanted` matches.
fn filter_nodes(
    args: &FilterArgs<'_>,
    filter: &Map<String, Value>,
    wanted: Option<usize>,
) -> anyhow::Result<Vec<(Arc<Node>, Value)>> {
    let mut matched = vec![];

    for node in candidates(args) {
        if wanted.is_some_and(|wanted| matched.len() >= wanted) {
            break;
        }

        let view = node.to_resolved_value();
        if matches_filter(&view, filter)? {
            matched.push((node, view));
        }
    }

    Ok(matched)
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |value, segment| value.get(segment))
        .filter(|value| !value.is_null())
}

fn matches_filter(source: &Value, filter: &Map<String, Value>) -> anyhow::Result<bool> {
    for (key, condition) in filter {
        let value = source.get(key).unwrap_or(&Value::Null);
        if !matches_field(value, condition)? {
            return Ok(false);
        }
    }

    Ok(true)
}

fn matches_field(value: &Value, condition: &Value) -> anyhow::Result<bool> {
    let Value::Object(operators) = condition else {
        bail!("Filter condition must be an object, found {condition}");
    };

    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "eq" => any_element(value, |v| v == operand),
            "ne" => !any_element(value, |v| v == operand),
            "in" => {
                let list = as_list(operator, operand)?;
                any_element(value, |v| list.contains(v))
            }
            "nin" => {
                let list = as_list(operator, operand)?;
                !any_element(value, |v| list.contains(v))
            }
            "gt" => any_element(value, |v| compare(v, operand) == Some(Ordering::Greater)),
            "gte" => any_element(value, |v| compare(v, operand).is_some_and(Ordering::is_ge)),
            "lt" => any_element(value, |v| compare(v, operand) == Some(Ordering::Less)),
            "lte" => any_element(value, |v| compare(v, operand).is_some_and(Ordering::is_le)),
            "glob" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| anyhow!("Operator 'glob' expects a string"))?;
                let pattern = glob::Pattern::new(pattern)?;
                any_element(value, |v| v.as_str().is_some_and(|s| pattern.matches(s)))
            }
            ELEM_MATCH => {
                let Value::Object(nested) = operand else {
                    bail!("Operator '{ELEM_MATCH}' expects an object");
                };
                match value {
                    Value::Array(items) => any_ok(items, |item| matches_filter(item, nested))?,
                    _ => false,
                }
            }
            _ if operand.is_object() => {
                // Not an operator, a nested field of an object value.
                let mut nested = Map::new();
                nested.insert(operator.clone(), operand.clone());
                match value {
                    Value::Array(items) => any_ok(items, |item| matches_filter(item, &nested))?,
                    value => matches_filter(value, &nested)?,
                }
            }
            _ => bail!("Unsupported filter operator '{operator}'"),
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn as_list<'a>(operator: &str, operand: &'a Value) -> anyhow::Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| anyhow!("Operator '{operator}' expects a list"))
}

fn any_element(value: &Value, predicate: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(predicate),
        value => predicate(value),
    }
}

fn any_ok(
    items: &[Value],
    predicate: impl Fn(&Value) -> anyhow::Result<bool>,
) -> anyhow::Result<bool> {
    for item in items {
        if predicate(item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Missing values always sort last.
fn compare_sort(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ordering = compare(a, b).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> MemoryStore {
        let nodes = [
            json!({ "id": "1", "internal": { "type": "Post" }, "title": "A", "views": 10,
                    "tags": ["rust", "ssg"], "authors": [{ "name": "Ann" }] }),
            json!({ "id": "2", "internal": { "type": "Post" }, "title": "B", "views": 30,
                    "tags": ["go"], "authors": [{ "name": "Bob" }, { "name": "Ann" }] }),
            json!({ "id": "3", "internal": { "type": "Post" }, "title": "C",
                    "meta": { "slug": "/c/" } }),
            json!({ "id": "4", "internal": { "type": "Page" }, "title": "B" }),
        ];

        MemoryStore::with_nodes(nodes.into_iter().map(|n| Node::from_value(n).unwrap()))
    }

    fn run(store: &MemoryStore, query: Value, first_only: bool) -> Vec<String> {
        let query: QueryArgs = serde_json::from_value(query).unwrap();
        let types = vec!["Post".to_string()];

        MemoryExecutor
            .run(FilterArgs {
                query: &query,
                first_only,
                node_type_names: &types,
                store,
                cache: None,
            })
            .unwrap()
            .iter()
            .map(|node| node.id().to_string())
            .collect()
    }

    #[test]
    fn test_eq() {
        let store = store();
        let by_title = json!({ "filter": { "title": { "eq": "B" } } });
        assert_eq!(run(&store, by_title, false), vec!["2"]);
        let by_tag = json!({ "filter": { "tags": { "eq": "rust" } } });
        assert_eq!(run(&store, by_tag, false), vec!["1"]);
        assert_eq!(run(&store, json!({}), false), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_comparisons() {
        let store = store();
        assert_eq!(run(&store, json!({ "filter": { "views": { "gt": 10 } } }), false), vec!["2"]);
        assert_eq!(
            run(&store, json!({ "filter": { "views": { "gte": 10, "lte": 30 } } }), false),
            vec!["1", "2"]
        );
        assert_eq!(
            run(&store, json!({ "filter": { "title": { "nin": ["A", "B"] } } }), false),
            vec!["3"]
        );
        assert_eq!(
            run(&store, json!({ "filter": { "title": { "ne": "A" } } }), false),
            vec!["2", "3"]
        );
    }

    #[test]
    fn test_nested_and_glob() {
        let store = store();
        assert_eq!(
            run(&store, json!({ "filter": { "meta": { "slug": { "glob": "/c/*" } } } }), false),
            vec!["3"]
        );
        assert_eq!(
            run(
                &store,
                json!({ "filter": { "authors": { "elemMatch": { "name": { "eq": "Ann" } } } } }),
                false
            ),
            vec!["1", "2"]
        );
    }

    #[test]
    fn test_sort_skip_limit() {
        let store = store();
        let query = json!({ "sort": { "fields": ["views"], "order": ["DESC"] } });
        assert_eq!(run(&store, query.clone(), false), vec!["2", "1", "3"]);
        assert_eq!(run(&store, query, true), vec!["2"]);

        let query = json!({ "sort": { "fields": ["title"] }, "skip": 1, "limit": 1 });
        assert_eq!(run(&store, query, false), vec!["2"]);
    }

    #[test]
    fn test_reads_resolved_fields() {
        let store = store();
        let node = store.get_node("1").unwrap();
        let mut resolved = Map::new();
        resolved.insert("slug".into(), json!("/a/"));
        node.merge_resolved(resolved);

        assert_eq!(run(&store, json!({ "filter": { "slug": { "eq": "/a/" } } }), false), vec!["1"]);
    }

    #[test]
    fn test_unsupported_operator() {
        let store = store();
        let query: QueryArgs =
            serde_json::from_value(json!({ "filter": { "title": { "regex": "/A/" } } })).unwrap();
        let types = vec!["Post".to_string()];

        let result = MemoryExecutor.run(FilterArgs {
            query: &query,
            first_only: false,
            node_type_names: &types,
            store: &store,
            cache: None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_aggregates_are_rejected() {
        let store = store();

        let args = [
            json!({ "group": "title" }),
            json!({ "distinct": ["title"] }),
            json!({ "sum": "views" }),
        ];

        for arg in args {
            let query: QueryArgs = serde_json::from_value(arg).unwrap();
            let types = vec!["Post".to_string()];

            let result = MemoryExecutor.run(FilterArgs {
                query: &query,
                first_only: false,
                node_type_names: &types,
                store: &store,
                cache: None,
            });

            assert!(result.unwrap_err().to_string().contains("not supported"));
        }
    }

    /// Records which types were asked for.
    struct Lookups {
        inner: MemoryStore,
        types: Mutex<Vec<String>>,
    }

    impl NodeStore for Lookups {
        fn get_node(&self, id: &str) -> Option<Arc<Node>> {
            self.inner.get_node(id)
        }

        fn get_nodes(&self) -> Vec<Arc<Node>> {
            self.inner.get_nodes()
        }

        fn get_nodes_by_type(&self, type_name: &str) -> Vec<Arc<Node>> {
            self.types.lock().unwrap().push(type_name.to_string());
            self.inner.get_nodes_by_type(type_name)
        }

        fn get_types(&self) -> Vec<String> {
            self.inner.get_types()
        }
    }

    #[test]
    fn test_first_only_stops_at_first_match() {
        let store = Lookups {
            inner: store(),
            types: Mutex::default(),
        };
        let types = vec!["Post".to_string(), "Page".to_string()];
        let run = |query: Value, first_only| {
            let query: QueryArgs = serde_json::from_value(query).unwrap();
            let nodes = MemoryExecutor
                .run(FilterArgs {
                    query: &query,
                    first_only,
                    node_type_names: &types,
                    store: &store,
                    cache: None,
                })
                .unwrap();
            let looked_up = std::mem::take(&mut *store.types.lock().unwrap());
            (nodes.iter().map(|node| node.id().to_string()).collect::<Vec<_>>(), looked_up)
        };

        let (found, looked_up) = run(json!({ "filter": { "title": { "eq": "B" } } }), true);
        assert_eq!(found, vec!["2"]);
        assert_eq!(looked_up, vec!["Post"]);

        let (found, looked_up) = run(json!({ "limit": 2 }), false);
        assert_eq!(found, vec!["1", "2"]);
        assert_eq!(looked_up, vec!["Post"]);

        // Sorting has to see every candidate.
        let query = json!({ "filter": { "title": { "eq": "B" } }, "sort": { "fields": ["id"] } });
        let (found, looked_up) = run(query, true);
        assert_eq!(found, vec!["2"]);
        assert_eq!(looked_up, vec!["Post", "Page"]);
    }

    #[test]
    fn test_filters_cache() {
        let store = store();
        let cache = FiltersCache::new();
        let query: QueryArgs =
            serde_json::from_value(json!({ "filter": { "title": { "eq": "B" } } })).unwrap();
        let types = vec!["Post".to_string()];

        let args = || FilterArgs {
            query: &query,
            first_only: false,
            node_type_names: &types,
            store: &store,
            cache: Some(&cache),
        };

        let first = MemoryExecutor.run(args()).unwrap();
        assert_eq!(cache.len(), 1);

        // Served from the cache: the node no longer matches, yet is returned.
        store.add_node(
            Node::from_value(json!({ "id": "2", "internal": { "type": "Post" }, "title": "Z" }))
                .unwrap(),
        );
        let second = MemoryExecutor.run(args()).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].get("title"), Some(&json!("Z")));
    }
}
