//! Worker registry and capability table.

use crate::error::MetadataResult;
use crate::models::{WorkerRow, WorkerState};
use async_trait::async_trait;

/// A resource type reported by a worker at registration: the capability to
/// run `resource_type` using `image` at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResourceTypeSpec {
    pub resource_type: String,
    pub image: String,
    pub version: String,
}

impl WorkerResourceTypeSpec {
    pub fn new(
        resource_type: impl Into<String>,
        image: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            image: image.into(),
            version: version.into(),
        }
    }
}

/// Repository for workers and their capability rows.
#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Upsert a worker and reconcile its capability table against the
    /// reported resource types, in one transaction:
    ///
    /// - each reported type find-or-creates its base type and capability row;
    /// - a capability row whose image/version changed is retired (its id is
    ///   deleted), which invalidates every placement tagged with it;
    /// - capability rows for types no longer reported are retired the same
    ///   way.
    async fn save_worker(
        &self,
        name: &str,
        state: WorkerState,
        ephemeral: bool,
        resource_types: &[WorkerResourceTypeSpec],
    ) -> MetadataResult<WorkerRow>;

    async fn find_worker(&self, name: &str) -> MetadataResult<Option<WorkerRow>>;

    async fn workers(&self) -> MetadataResult<Vec<WorkerRow>>;

    /// Flip a worker's lifecycle state. Returns false if the worker is gone.
    async fn set_worker_state(&self, name: &str, state: WorkerState) -> MetadataResult<bool>;

    /// Remove a worker outright. Its containers, volumes, capability rows,
    /// and placements go with it; other workers' placements are untouched.
    async fn prune_worker(&self, name: &str) -> MetadataResult<bool>;
}
