//! Error type returned by the engine's public operations.

use resource_index_core::embedding::EmbedError;
use resource_index_core::models::{ResourceKind, ResourceState};
use resource_index_core::store::StoreError;

/// Errors surfaced by [`Engine`](crate::engine::Engine) operations.
///
/// Registry-level failures (`NotFound`, `Conflict`, `InvalidArgument`,
/// `NotReady`, `AlreadyFinished`, `Busy`) are returned synchronously.
/// Pipeline failures end up as job and resource error text instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("a {kind} resource named '{name}' already exists")]
    Conflict { kind: ResourceKind, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: String,
        from: ResourceState,
        to: ResourceState,
    },

    #[error("job {0} has already finished")]
    AlreadyFinished(String),

    #[error("resource {0} has no committed index yet")]
    NotReady(String),

    #[error("index of resource {resource_id} is unreadable; rebuild submitted as job {job_id}")]
    IndexCorrupted { resource_id: String, job_id: String },

    #[error("engine is busy: {0}")]
    Busy(String),

    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    #[error("source produced no indexable content")]
    EmptySource,

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0}s")]
    TimedOut(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
