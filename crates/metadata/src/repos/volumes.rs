//! Volume lifecycle, cache initialization, and reconciliation sweeps.

use crate::error::MetadataResult;
use crate::models::{
    VolumeRow, WorkerArtifactRow, WorkerResourceCacheRow, WorkerResourceCertsRow,
    WorkerTaskCacheRow,
};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Repository for volume rows, their state machine, cache blessing, and GC
/// sweeps.
#[async_trait]
pub trait VolumeRepo: Send + Sync {
    /// Upsert the task cache identity (worker, job, step, path).
    async fn find_or_create_worker_task_cache(
        &self,
        worker_name: &str,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> MetadataResult<WorkerTaskCacheRow>;

    /// Upsert the resource certs identity for a worker.
    async fn find_or_create_worker_resource_certs(
        &self,
        worker_name: &str,
        certs_path: &str,
    ) -> MetadataResult<WorkerResourceCertsRow>;

    /// Insert a `creating` volume owned by a container.
    async fn create_container_volume(
        &self,
        worker_name: &str,
        container_id: i64,
        path: &str,
        team_id: Option<i64>,
    ) -> MetadataResult<VolumeRow>;

    /// Insert a `creating` volume holding a base resource type image.
    async fn create_base_resource_type_volume(
        &self,
        worker_base_resource_type_id: i64,
        team_id: Option<i64>,
    ) -> MetadataResult<VolumeRow>;

    /// Insert a `creating` volume for a task cache.
    async fn create_task_cache_volume(
        &self,
        worker_task_cache_id: i64,
        team_id: Option<i64>,
    ) -> MetadataResult<VolumeRow>;

    /// Insert a `creating` volume for a worker's resource certs bundle.
    async fn create_resource_certs_volume(
        &self,
        worker_resource_certs_id: i64,
    ) -> MetadataResult<VolumeRow>;

    /// Insert a filesystem child of a created volume, mounted into a
    /// container. The child pins its parent's `created` state.
    async fn create_child_volume(
        &self,
        parent_id: i64,
        container_id: i64,
        path: &str,
    ) -> MetadataResult<VolumeRow>;

    async fn find_volume_by_handle(&self, handle: &str) -> MetadataResult<Option<VolumeRow>>;

    /// Find the created cache volume for (worker, cache), going through the
    /// placement table so the `as_of` validity rule applies.
    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
        as_of: OffsetDateTime,
    ) -> MetadataResult<Option<VolumeRow>>;

    async fn find_container_volumes(&self, container_id: i64) -> MetadataResult<Vec<VolumeRow>>;

    /// creating -> created. Idempotent.
    async fn volume_created(&self, id: i64) -> MetadataResult<()>;

    /// creating -> failed.
    async fn volume_failed(&self, id: i64) -> MetadataResult<()>;

    /// created -> destroying. Fails with
    /// `VolumeCannotBeDestroyedWithChildrenPresent` while any child exists.
    async fn volume_destroying(&self, id: i64) -> MetadataResult<()>;

    /// Delete a destroying/failed volume. Returns false when the row is
    /// already gone.
    async fn destroy_volume(&self, id: i64) -> MetadataResult<bool>;

    /// Bless a created, container-owned volume as the worker's cache volume
    /// for `resource_cache_id`, under the worker's current capability for
    /// the cache's origin base type. Clears team ownership: the volume
    /// becomes cluster-shared. Returns `None` (and changes nothing) when
    /// another volume already won the race — the loser stays owned by its
    /// container and expires with it.
    async fn initialize_resource_cache(
        &self,
        volume_id: i64,
        resource_cache_id: i64,
    ) -> MetadataResult<Option<WorkerResourceCacheRow>>;

    /// Same as `initialize_resource_cache`, for a volume streamed from
    /// another worker. The source placement must still exist and be valid;
    /// if it was invalidated after the stream started, the volume is left
    /// alone (not an error — the build still has its bytes). The new
    /// placement is tagged with the destination worker's own capability,
    /// so each worker's placement validity is independent.
    async fn initialize_streamed_resource_cache(
        &self,
        volume_id: i64,
        resource_cache_id: i64,
        source_worker_resource_cache_id: i64,
    ) -> MetadataResult<Option<WorkerResourceCacheRow>>;

    /// Bless a created volume as the worker's cache for a task cache,
    /// detaching any previously blessed volume. Returns false when another
    /// volume won the race (silent no-op, same rule as resource caches).
    async fn initialize_task_cache(
        &self,
        volume_id: i64,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> MetadataResult<bool>;

    /// Register a created volume as a free-standing build artifact.
    async fn initialize_artifact(
        &self,
        volume_id: i64,
        name: &str,
        build_id: Option<i64>,
    ) -> MetadataResult<WorkerArtifactRow>;

    /// Created volumes with no owning reference of any type, on workers in
    /// running/landing/retiring state. Stalled workers' volumes are left
    /// alone: they are presumed present but unreported.
    async fn find_orphaned_volumes(&self) -> MetadataResult<Vec<VolumeRow>>;

    /// Move orphaned volumes into `destroying`, children before parents;
    /// a parent with a live child is skipped this pass and picked up once
    /// the child is gone.
    async fn destroy_orphaned_volumes(&self) -> MetadataResult<u64>;

    /// Delete failed volumes outright.
    async fn destroy_failed_volumes(&self) -> MetadataResult<u64>;

    /// Handles the worker should be told to destroy.
    async fn find_destroying_volume_handles(
        &self,
        worker_name: &str,
    ) -> MetadataResult<Vec<String>>;

    /// Delete destroying rows the worker no longer reports.
    async fn remove_destroying_volumes(
        &self,
        worker_name: &str,
        still_held: &[String],
    ) -> MetadataResult<u64>;

    /// Reconcile `missing_since` against the worker's reported handle set.
    async fn update_volumes_missing_since(
        &self,
        worker_name: &str,
        reported_handles: &[String],
    ) -> MetadataResult<()>;

    /// Delete created volumes missing for longer than the grace period,
    /// skipping stalled workers.
    async fn remove_missing_volumes(&self, grace_period: Duration) -> MetadataResult<u64>;

    /// Insert `destroying` rows for handles reported by the worker but
    /// absent from the database.
    async fn destroy_unknown_volumes(
        &self,
        worker_name: &str,
        reported_handles: &[String],
    ) -> MetadataResult<u64>;
}
