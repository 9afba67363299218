use std::sync::Arc;

use thiserror::Error;

/// A failure raised while resolving one batch of fields.
///
/// Every query waiting on the same batch observes the same error, so the
/// underlying `anyhow::Error` is shared behind an `Arc`.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct ResolveError(#[from] pub(crate) Arc<anyhow::Error>);

impl ResolveError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for ResolveError {
    fn from(e: anyhow::Error) -> Self {
        ResolveError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Querying union type '{0}' is not supported.")]
    UnionNotSupported(String),

    #[error("Type '{0}' is not defined in the schema")]
    UnknownType(String),

    #[error("Invalid field shape:\n{0}")]
    Shape(#[from] ShapeError),

    #[error("Error while resolving fields of type '{0}':\n{1}")]
    Resolve(String, ResolveError),

    #[error("Error while filtering nodes:\n{0}")]
    Filter(anyhow::Error),

    #[error("Node model is missing its {0}")]
    Config(&'static str),

    #[error("Resolving fields requires a running Tokio runtime")]
    NoRuntime,
}

/// Merging two field shapes that disagree on whether a field is a leaf.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Field '{0}' is requested both as a leaf and as a nested selection")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node data must be a JSON object")]
    NotAnObject,

    #[error("Node data is missing a string 'id'")]
    MissingId,

    #[error("Node '{0}' is missing 'internal.type'")]
    MissingType(String),

    #[error("Node '{0}' has a 'parent' which is neither a string nor null")]
    InvalidParent(String),
}
