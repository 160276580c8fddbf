//! Worker resource cache placement.

use crate::error::MetadataResult;
use crate::models::WorkerResourceCacheRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for cache placements: the record that a cache's bytes exist
/// on a specific worker, tagged with the capability generation current at
/// placement time.
#[async_trait]
pub trait WorkerResourceCacheRepo: Send + Sync {
    /// Find the placement for (worker, cache), if it is still usable as of
    /// `as_of`: either its capability reference is intact, or it was
    /// invalidated after `as_of`. A build that started before an
    /// invalidation may still stream from the placement; new work after
    /// the invalidation must re-fetch.
    async fn find_worker_resource_cache(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
        as_of: OffsetDateTime,
    ) -> MetadataResult<Option<WorkerResourceCacheRow>>;

    /// Insert the placement tagged with the caller's capability id, or
    /// return the existing row untouched. The flag is true only for the
    /// caller that created the row: everyone else sees the authoritative
    /// placement, possibly under a different (even invalidated) capability.
    async fn find_or_create_worker_resource_cache(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
        worker_base_resource_type_id: i64,
    ) -> MetadataResult<(WorkerResourceCacheRow, bool)>;
}
