//! Metadata store error types.

use crate::state::LifecycleState;
use thiserror::Error;

/// Metadata store operation errors.
///
/// "Disappeared" variants mean the row existed and raced away (usually GC
/// winning); they are never retried by this layer. Lookup misses are
/// reported as `Option::None` by the repository methods, not as errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] capstan_core::Error),

    #[error("base resource type not found: {name}")]
    BaseResourceTypeNotFound { name: String },

    #[error("worker {worker} no longer provides base resource type {name}")]
    WorkerBaseResourceTypeDisappeared { worker: String, name: String },

    #[error("resource cache {0} disappeared")]
    ResourceCacheDisappeared(i64),

    #[error("invalid resource cache chain: {0}")]
    InvalidResourceCacheChain(String),

    #[error("container {0} no longer in db")]
    ContainerDisappeared(i64),

    #[error("could not mark container {id} as {state}")]
    ContainerMarkStateFailed { id: i64, state: LifecycleState },

    #[error("volume {0} no longer in db")]
    VolumeMissing(i64),

    #[error("could not mark volume {id} as {state}")]
    VolumeMarkStateFailed { id: i64, state: LifecycleState },

    #[error("failed to mark volume {0} as created")]
    VolumeMarkCreatedFailed(i64),

    #[error("volume {0} cannot be destroyed as children are present")]
    VolumeCannotBeDestroyedWithChildrenPresent(i64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Whether a sqlx error is a unique-constraint violation.
///
/// SQLite reports these as database errors whose message names the
/// constraint kind; there is no stable error code surface beyond that.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint"))
}

/// Whether a sqlx error is a foreign-key violation.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("FOREIGN KEY constraint"))
}
