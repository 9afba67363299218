use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{Instrument, Level};

use crate::error::{QueryError, ResolveError};
use crate::model::NodeModel;
use crate::node::Node;
use crate::resolve::resolve_recursive;
use crate::shape::FieldShape;

/// Completion signal of one batch, awaited by every caller it serves.
type Pending = Shared<BoxFuture<'static, Result<(), ResolveError>>>;

/// A `(query_fields, fields_to_resolve)` pair.
type Request = (FieldShape, FieldShape);

tokio::task_local! {
    /// Set while a batch job runs, so queries issued by its resolvers can be
    /// told apart from queries issued from outside.
    static IN_BATCH: ();
}

#[derive(Default)]
struct TypeQueue {
    requests: Vec<Request>,
    /// Batch still accepting requests.
    pending: Option<Pending>,
    /// Batch which stopped accepting requests and is resolving.
    in_flight: Option<Pending>,
}

/// Per-type batching of field resolution.
///
/// Requests for the same type arriving before a batch starts are merged
/// into that batch and share its completion signal. A batch starts after
/// the batch before it has finished, so there is at most one resolution
/// pass per type at any time. What has already been resolved is tracked on
/// the nodes themselves, so a node added later still gets resolved.
#[derive(Default)]
pub(crate) struct PrepareQueue {
    queues: Mutex<HashMap<String, TypeQueue>>,
}

impl PrepareQueue {
    fn enqueue(
        &self,
        model: &NodeModel,
        runtime: &Handle,
        type_name: &str,
        request: Request,
    ) -> Pending {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(type_name.to_string()).or_default();
        queue.requests.push(request);

        if let Some(pending) = &queue.pending {
            return pending.clone();
        }

        tracing::debug!(type_name, "scheduling resolution batch");

        let handle = runtime.spawn(IN_BATCH.scope(
            (),
            run_batch(model.clone(), type_name.to_string(), queue.in_flight.clone()),
        ));

        let pending = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ResolveError::new(anyhow!("Resolution batch was aborted: {e}"))),
            }
        }
        .boxed()
        .shared();

        queue.pending = Some(pending.clone());
        pending
    }

    /// Moves the queued requests of a type out, closing its pending batch.
    fn take(&self, type_name: &str) -> Vec<Request> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        match queues.get_mut(type_name) {
            Some(queue) => {
                queue.in_flight = queue.pending.take();
                mem::take(&mut queue.requests)
            }
            None => vec![],
        }
    }

    /// Clears the in-flight batch of a type, and the whole entry when no
    /// other batch is waiting.
    fn finish(&self, type_name: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(queue) = queues.get_mut(type_name) {
            queue.in_flight = None;
            if queue.requests.is_empty() && queue.pending.is_none() {
                queues.remove(type_name);
            }
        }
    }

    #[cfg(test)]
    fn is_idle(&self, type_name: &str) -> bool {
        !self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_name)
    }
}

/// Makes sure `fields_to_resolve` is present in the resolved-field cache of
/// every node of `type_name`. Concurrent calls for one type are coalesced.
pub(crate) async fn prepare_nodes(
    model: &NodeModel,
    type_name: &str,
    query_fields: FieldShape,
    fields_to_resolve: FieldShape,
) -> Result<(), QueryError> {
    let request = (query_fields, fields_to_resolve);

    let result = match IN_BATCH.try_with(|_| ()) {
        // A resolver querying from inside a running batch. Joining the queue
        // would mean waiting on the batch the resolver is part of.
        Ok(()) => resolve_requests(model, type_name, vec![request])
            .await
            .map_err(ResolveError::from),
        Err(_) => {
            let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;
            model
                .prepare_queue()
                .enqueue(model, &runtime, type_name, request)
                .await
        }
    };

    result.map_err(|e| QueryError::Resolve(type_name.to_string(), e))
}

async fn run_batch(
    model: NodeModel,
    type_name: String,
    previous: Option<Pending>,
) -> Result<(), ResolveError> {
    if let Some(previous) = previous {
        // Its failure belongs to its own callers.
        let _ = previous.await;
    }

    // Let every caller of the current turn enqueue first.
    tokio::task::yield_now().await;

    let requests = model.prepare_queue().take(&type_name);
    let result = resolve_requests(&model, &type_name, requests).await;
    model.prepare_queue().finish(&type_name);

    result.map_err(ResolveError::from)
}

async fn resolve_requests(
    model: &NodeModel,
    type_name: &str,
    requests: Vec<Request>,
) -> anyhow::Result<()> {
    let query_fields = FieldShape::merged(requests.iter().map(|(query, _)| query))?;
    let to_resolve = FieldShape::merged(requests.iter().map(|(_, resolve)| resolve))?;
    let node_type_names = model.schema().node_type_names(type_name);

    // Nodes added or replaced since the last batch owe everything.
    let owing = node_type_names
        .iter()
        .flat_map(|name| model.store().get_nodes_by_type(name))
        .any(|node| !node.owed(&to_resolve).is_empty());

    if !owing {
        tracing::debug!(type_name, requests = requests.len(), "nothing left to resolve");
        return Ok(());
    }

    let span = tracing::span!(Level::INFO, "prepare_nodes", type_name);

    async {
        let start = Instant::now();
        let query_fields = Arc::new(query_fields);
        let fields = Arc::new(to_resolve);
        let visited: Arc<Mutex<Vec<(Arc<Node>, FieldShape)>>> = Arc::default();

        let visitor = {
            let model = model.clone();
            let query_fields = query_fields.clone();
            let fields = fields.clone();
            let visited = visited.clone();
            let fallback = type_name.to_string();

            move |node: Arc<Node>| -> BoxFuture<'static, anyhow::Result<Map<String, Value>>> {
                let model = model.clone();
                let query_fields = query_fields.clone();
                let fields = fields.clone();
                let visited = visited.clone();
                let fallback = fallback.clone();

                Box::pin(async move {
                    model.root_nodes().track(&node);

                    let owed = node.owed(&fields);
                    if owed.is_empty() {
                        return Ok(Map::new());
                    }

                    let type_name = match model.schema().get(node.type_name()) {
                        Some(_) => node.type_name(),
                        None => fallback.as_str(),
                    };

                    let resolved =
                        resolve_recursive(&model, node.to_value(), type_name, &query_fields, &owed)
                            .await?;

                    visited
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((node, owed));

                    Ok(resolved)
                })
            }
        };

        model
            .store()
            .save_resolved_nodes(&node_type_names, &visitor)
            .await?;

        // Only once the store has merged every result.
        let visited = mem::take(&mut *visited.lock().unwrap_or_else(PoisonError::into_inner));
        for (node, owed) in &visited {
            node.mark_resolved(owed)?;
        }

        tracing::info!(
            requests = requests.len(),
            nodes = visited.len(),
            fields = fields.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "resolved fields of {}",
            node_type_names.join(", ")
        );

        anyhow::Ok(())
    }
    .instrument(span)
    .await
}
