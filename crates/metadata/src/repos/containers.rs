//! Container lifecycle and reconciliation sweeps.

use crate::error::MetadataResult;
use crate::models::ContainerRow;
use async_trait::async_trait;
use time::Duration;

/// Who a container exists for. The owner determines when the container
/// becomes orphaned: its owning entity changed state or disappeared.
///
/// This is a closed set; the store matches on it exhaustively wherever
/// owner-specific insert columns or find predicates are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOwner {
    /// A step of a durable build. Orphaned once the build is gone or no
    /// longer interceptible.
    Build { build_id: i64, plan_id: String },
    /// Checking a step's image resource. Orphaned once the owning container
    /// has moved past `creating`.
    ImageCheck { container_id: i64 },
    /// Fetching a step's image resource. Same orphan rule as image checks.
    ImageGet { container_id: i64 },
    /// A resource check session. Orphaned once the session expires or is
    /// collected.
    ResourceConfigCheckSession { session_id: i64 },
}

/// Repository for container rows, their state machine, and GC sweeps.
#[async_trait]
pub trait ContainerRepo: Send + Sync {
    /// Insert a container in `creating` state with a freshly minted handle.
    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        team_id: Option<i64>,
    ) -> MetadataResult<ContainerRow>;

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> MetadataResult<Option<ContainerRow>>;

    /// Find the container owned by `owner` on a worker, if any.
    async fn find_container_for_owner(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> MetadataResult<Option<ContainerRow>>;

    /// creating -> created. Idempotent; retrying after a crash is safe.
    async fn container_created(&self, id: i64) -> MetadataResult<()>;

    /// creating -> failed.
    async fn container_failed(&self, id: i64) -> MetadataResult<()>;

    /// created -> destroying.
    async fn container_destroying(&self, id: i64) -> MetadataResult<()>;

    /// Delete a destroying/failed container. Returns false when the row is
    /// already gone — GC racing is a normal outcome, not an error.
    async fn destroy_container(&self, id: i64) -> MetadataResult<bool>;

    /// Containers whose owner no longer justifies their existence.
    async fn find_orphaned_containers(&self) -> MetadataResult<Vec<ContainerRow>>;

    /// Bulk-move orphaned containers into `destroying` directly at the
    /// repository level, bypassing the per-row state machine.
    async fn destroy_orphaned_containers(&self) -> MetadataResult<u64>;

    /// Move failed containers into `destroying` so the next worker
    /// reconciliation removes them.
    async fn destroy_failed_containers(&self) -> MetadataResult<u64>;

    /// Handles the worker should be told to destroy.
    async fn find_destroying_container_handles(
        &self,
        worker_name: &str,
    ) -> MetadataResult<Vec<String>>;

    /// Delete destroying rows the worker no longer reports (it finished
    /// destroying them). `still_held` is the worker's current handle set.
    async fn remove_destroying_containers(
        &self,
        worker_name: &str,
        still_held: &[String],
    ) -> MetadataResult<u64>;

    /// Reconcile `missing_since` against a worker's reported handle set:
    /// reported rows are un-marked, unreported rows (except `creating`)
    /// are marked missing as of now.
    async fn update_containers_missing_since(
        &self,
        worker_name: &str,
        reported_handles: &[String],
    ) -> MetadataResult<()>;

    /// Delete created containers missing for longer than the grace period,
    /// skipping stalled workers entirely.
    async fn remove_missing_containers(&self, grace_period: Duration) -> MetadataResult<u64>;

    /// Insert rows in `destroying` state for handles the worker reports
    /// but the database has never heard of, so the next reconciliation
    /// tells the runtime to remove them.
    async fn destroy_unknown_containers(
        &self,
        worker_name: &str,
        reported_handles: &[String],
    ) -> MetadataResult<u64>;
}
