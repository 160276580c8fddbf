//! Fixture helpers: registered workers, builds, caches, containers, volumes.

#![allow(dead_code)]

use capstan_core::Version;
use capstan_metadata::models::*;
use capstan_metadata::repos::*;
use capstan_metadata::SqliteStore;
use serde_json::json;
use time::OffsetDateTime;

pub const GIT_IMAGE: &str = "/opt/resource-types/git";
pub const S3_IMAGE: &str = "/opt/resource-types/s3";

/// Register a worker providing git and s3 resource types.
pub async fn register_worker(store: &SqliteStore, name: &str) -> WorkerRow {
    store
        .save_worker(
            name,
            WorkerState::Running,
            false,
            &[
                WorkerResourceTypeSpec::new("git", GIT_IMAGE, "1.0"),
                WorkerResourceTypeSpec::new("s3", S3_IMAGE, "1.0"),
            ],
        )
        .await
        .expect("failed to save worker")
}

/// The worker's current capability row id for a base resource type.
pub async fn capability_id(store: &SqliteStore, worker: &str, type_name: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "SELECT wbrt.id
         FROM worker_base_resource_types wbrt
         JOIN base_resource_types brt ON brt.id = wbrt.base_resource_type_id
         WHERE wbrt.worker_name = ? AND brt.name = ?",
    )
    .bind(worker)
    .bind(type_name)
    .fetch_one(store.pool())
    .await
    .expect("no capability row");
    id
}

/// Create a build and mark it started.
pub async fn started_build(store: &SqliteStore) -> BuildRow {
    let build = store
        .create_build("a-build", None)
        .await
        .expect("failed to create build");
    store
        .start_build(build.id, OffsetDateTime::now_utc())
        .await
        .expect("failed to start build");
    build
}

pub fn git_source() -> serde_json::Value {
    json!({"uri": "https://example.com/repo.git", "branch": "main"})
}

/// Descriptor for a git cache at the given version, empty params.
pub fn git_cache_descriptor(version: Version) -> ResourceCacheDescriptor {
    ResourceCacheDescriptor {
        resource_type: "git".to_string(),
        version,
        source: git_source(),
        params: json!({}),
        created_by_resource_cache_id: None,
    }
}

/// Create a git resource cache used by the given build.
pub async fn git_cache(store: &SqliteStore, build_id: i64) -> ResourceCacheRow {
    store
        .find_or_create_resource_cache(
            ResourceCacheUser::Build(build_id),
            &git_cache_descriptor(Version::single("ref", "abc123")),
        )
        .await
        .expect("failed to create resource cache")
}

/// Create a build-step container and mark it created.
pub async fn created_container(
    store: &SqliteStore,
    worker: &str,
    build_id: i64,
) -> ContainerRow {
    let container = store
        .create_container(
            worker,
            &ContainerOwner::Build {
                build_id,
                plan_id: "some-plan".to_string(),
            },
            Some(1),
        )
        .await
        .expect("failed to create container");
    store
        .container_created(container.id)
        .await
        .expect("failed to mark container created");
    container
}

/// Create a container volume and mark it created.
pub async fn created_container_volume(
    store: &SqliteStore,
    worker: &str,
    container_id: i64,
) -> VolumeRow {
    let volume = store
        .create_container_volume(worker, container_id, "/tmp/build", Some(1))
        .await
        .expect("failed to create volume");
    store
        .volume_created(volume.id)
        .await
        .expect("failed to mark volume created");
    volume
}

/// Count rows in a table matching a one-column condition.
pub async fn count_rows(store: &SqliteStore, sql: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(sql)
        .fetch_one(store.pool())
        .await
        .expect("count query failed");
    count
}
