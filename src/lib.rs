#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod batch;
mod context;
mod determine;
mod error;
mod filter;
mod inline;
mod model;
mod node;
mod planner;
mod resolve;
mod schema;
mod shape;
mod store;
mod tracking;

pub use crate::context::ContextualNodeModel;
pub use crate::determine::determine_resolvable_fields;
pub use crate::error::*;
pub use crate::filter::{FilterArgs, FiltersCache, MemoryExecutor, QueryExecutor};
pub use crate::model::{Anchor, FindAll, NodeModel, NodeModelBuilder, QueryOutput, RunQuery};
pub use crate::node::Node;
pub use crate::planner::{OneOrMany, QueryArgs, SortArgs, SortOrder};
pub use crate::schema::{
    FieldDef, FieldResolver, FieldType, ResolveArgs, ResolverContext, Schema, SchemaBuilder,
    TypeDef, TypeKind, TypeResolver,
};
pub use crate::shape::{FieldEntry, FieldShape};
pub use crate::store::{MemoryStore, NodeStore, NodeVisitor};
pub use crate::tracking::{
    DependencyLog, DependencySink, DependencyTarget, PageDependencies, PageDependency, Trackable,
};

/// Installs a global `tracing` subscriber printing to stderr. The filter is
/// read from `RUST_LOG`, and defaults to `hauchiwa_query=info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hauchiwa_query=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
