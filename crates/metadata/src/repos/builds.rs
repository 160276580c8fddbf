//! Build registry collaborator surface.
//!
//! Builds are owned by the scheduler; this layer consumes only existence,
//! interceptibility, completion, and start time — the facts the cache-user
//! cleanup and placement-invalidation sweeps need.

use crate::error::MetadataResult;
use crate::models::{BuildRow, BuildStatus};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Narrow repository over durable builds.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    async fn create_build(&self, name: &str, team_id: Option<i64>) -> MetadataResult<BuildRow>;

    /// Mark a build started. Returns false if the build is gone.
    async fn start_build(&self, id: i64, start_time: OffsetDateTime) -> MetadataResult<bool>;

    /// Mark a build finished with a terminal status.
    async fn finish_build(&self, id: i64, status: BuildStatus) -> MetadataResult<bool>;

    /// Toggle whether the build can still be intercepted (entered for
    /// debugging). Non-interceptible finished builds release their
    /// containers and cache users.
    async fn set_build_interceptible(&self, id: i64, interceptible: bool)
        -> MetadataResult<bool>;

    async fn find_build(&self, id: i64) -> MetadataResult<Option<BuildRow>>;
}
