//! Garbage collection passes.
//!
//! Every pass is an idempotent, bounded request/response operation that
//! returns the number of rows it reclaimed; an external scheduler calls
//! them repeatedly. Passes never resume partial progress — each invocation
//! re-derives reachability from scratch. The container/volume sweeps
//! (orphaned, failed, missing, unknown, destroying reconciliation) live on
//! their respective repositories; this trait holds the passes over the
//! identity tables.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::Duration;

/// Default age after which an in-memory build's cache-user rows expire.
/// In-memory builds have no durable row to consult, so age is the only
/// signal.
pub const DEFAULT_IN_MEMORY_BUILD_USER_WINDOW: Duration = Duration::hours(24);

/// Repository for GC over caches, configs, placements, and check sessions.
#[async_trait]
pub trait GcRepo: Send + Sync {
    /// Delete invalidated placements whose invalidation predates the start
    /// of every running build, in batches of at most `limit` to keep
    /// transactions short. A placement is preserved while any running
    /// build's start time precedes its invalidation; a running build with
    /// no recorded start time preserves every invalidated placement.
    async fn clean_up_invalid_worker_resource_caches(&self, limit: u32) -> MetadataResult<u64>;

    /// Delete cache-user rows for finished, non-interceptible builds, and
    /// in-memory-build user rows older than `in_memory_window`
    /// unconditionally.
    async fn clean_up_expired_resource_cache_users(
        &self,
        in_memory_window: Duration,
    ) -> MetadataResult<u64>;

    /// Delete resource caches with zero remaining users, except those that
    /// parent a live resource config (a custom type's image stays until
    /// its dependents are gone). Batched by `limit`.
    async fn clean_up_unreferenced_resource_caches(&self, limit: u32) -> MetadataResult<u64>;

    /// Delete resource configs no longer reachable from any cache,
    /// resource, or live check session. Scopes and versions cascade.
    async fn clean_up_unreferenced_resource_configs(&self, limit: u32) -> MetadataResult<u64>;

    /// Delete expired check sessions, orphaning their containers.
    async fn clean_up_expired_check_sessions(&self) -> MetadataResult<u64>;

    /// Delete base resource types no longer referenced by any worker
    /// capability row or resource config.
    async fn clean_up_unused_base_resource_types(&self) -> MetadataResult<u64>;
}
