//! Garbage collection over placements, caches, and configs.

mod common;

use capstan_core::Version;
use capstan_metadata::models::{BuildStatus, WorkerState};
use capstan_metadata::repos::*;
use capstan_metadata::SqliteStore;
use common::fixtures::*;
use common::TestStore;

/// Place the build's git cache on the worker, then invalidate the placement
/// by re-registering the worker with a bumped git version.
async fn invalidated_placement(store: &SqliteStore, worker: &str, version: &str) -> i64 {
    let build = started_build(store).await;
    let cache = git_cache(store, build.id).await;
    let capability = capability_id(store, worker, "git").await;
    let (placement, _) = store
        .find_or_create_worker_resource_cache(worker, cache.id, capability)
        .await
        .expect("placement failed");

    store
        .finish_build(build.id, BuildStatus::Succeeded)
        .await
        .expect("finish failed");

    store
        .save_worker(
            worker,
            WorkerState::Running,
            false,
            &[WorkerResourceTypeSpec::new("git", GIT_IMAGE, version)],
        )
        .await
        .expect("re-register failed");

    placement.id
}

#[tokio::test]
async fn test_invalid_placements_are_collected_when_no_build_needs_them() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    invalidated_placement(&store, "worker-1", "2.0").await;

    let removed = store
        .clean_up_invalid_worker_resource_caches(100)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_builds_started_before_invalidation_protect_placements() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    // this build starts before the invalidation below
    let old_build = started_build(&store).await;

    invalidated_placement(&store, "worker-1", "2.0").await;

    let removed = store
        .clean_up_invalid_worker_resource_caches(100)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 0);

    // once the protecting build finishes, the placement is collectable
    store
        .finish_build(old_build.id, BuildStatus::Succeeded)
        .await
        .expect("finish failed");
    let removed = store
        .clean_up_invalid_worker_resource_caches(100)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 1);

    let count = count_rows(&store, "SELECT COUNT(*) FROM worker_resource_caches").await;
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_builds_started_after_invalidation_do_not_protect() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    invalidated_placement(&store, "worker-1", "2.0").await;

    // started after the invalidation; it must re-fetch, not pin
    started_build(&store).await;

    let removed = store
        .clean_up_invalid_worker_resource_caches(100)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_running_build_without_start_time_protects_everything() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    invalidated_placement(&store, "worker-1", "2.0").await;

    // a started build with no recorded start time is treated as predating
    // every invalidation
    let build = store
        .create_build("timeless", None)
        .await
        .expect("create failed");
    sqlx::query("UPDATE builds SET status = 'started' WHERE id = ?")
        .bind(build.id)
        .execute(store.pool())
        .await
        .expect("update failed");

    let removed = store
        .clean_up_invalid_worker_resource_caches(100)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn test_invalid_placement_collection_is_batched() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    let build = started_build(&store).await;
    let capability = capability_id(&store, "worker-1", "git").await;

    for i in 0..3 {
        let cache = store
            .find_or_create_resource_cache(
                ResourceCacheUser::Build(build.id),
                &git_cache_descriptor(Version::single("ref", format!("v{i}"))),
            )
            .await
            .expect("cache failed");
        store
            .find_or_create_worker_resource_cache("worker-1", cache.id, capability)
            .await
            .expect("placement failed");
    }

    store
        .finish_build(build.id, BuildStatus::Succeeded)
        .await
        .expect("finish failed");
    store
        .save_worker(
            "worker-1",
            WorkerState::Running,
            false,
            &[WorkerResourceTypeSpec::new("git", GIT_IMAGE, "2.0")],
        )
        .await
        .expect("re-register failed");

    assert_eq!(
        store
            .clean_up_invalid_worker_resource_caches(2)
            .await
            .expect("cleanup failed"),
        2
    );
    assert_eq!(
        store
            .clean_up_invalid_worker_resource_caches(2)
            .await
            .expect("cleanup failed"),
        1
    );
    assert_eq!(
        store
            .clean_up_invalid_worker_resource_caches(2)
            .await
            .expect("cleanup failed"),
        0
    );
}

#[tokio::test]
async fn test_end_to_end_cache_lifecycle() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    // identical requests converge on one cache id
    let build = started_build(&store).await;
    let cache_a = git_cache(&store, build.id).await;
    let again = git_cache(&store, build.id).await;
    assert_eq!(cache_a.id, again.id);
    assert_eq!(
        count_rows(&store, "SELECT COUNT(*) FROM resource_caches").await,
        1
    );

    // a cache parented by A resolves its base type transitively
    let cache_b = store
        .find_or_create_resource_cache(
            ResourceCacheUser::Build(build.id),
            &ResourceCacheDescriptor {
                resource_type: "notifier".to_string(),
                version: Version::single("build", "42"),
                source: serde_json::json!({"endpoint": "https://hooks.example.com"}),
                params: serde_json::json!({}),
                created_by_resource_cache_id: Some(cache_a.id),
            },
        )
        .await
        .expect("derived cache failed");
    let origin = store
        .origin_base_resource_type(cache_b.id)
        .await
        .expect("origin failed")
        .expect("no origin");
    assert_eq!(origin.name, "git");

    // a second live build also uses cache A
    let other_build = started_build(&store).await;
    git_cache(&store, other_build.id).await;

    // the first build finishes and stops being interceptible
    store
        .finish_build(build.id, BuildStatus::Succeeded)
        .await
        .expect("finish failed");
    store
        .set_build_interceptible(build.id, false)
        .await
        .expect("set interceptible failed");

    let removed = store
        .clean_up_expired_resource_cache_users(time::Duration::hours(24))
        .await
        .expect("cleanup failed");
    // cache A's and cache B's user rows for the finished build
    assert_eq!(removed, 2);

    // A survives: the other build still references it
    assert!(store
        .find_resource_cache_by_id(cache_a.id)
        .await
        .expect("lookup failed")
        .is_some());

    // B is unreferenced and goes; A follows once nothing references it
    let collected = store
        .clean_up_unreferenced_resource_caches(100)
        .await
        .expect("collection failed");
    assert_eq!(collected, 1);

    store
        .finish_build(other_build.id, BuildStatus::Aborted)
        .await
        .expect("finish failed");
    store
        .set_build_interceptible(other_build.id, false)
        .await
        .expect("set interceptible failed");
    store
        .clean_up_expired_resource_cache_users(time::Duration::hours(24))
        .await
        .expect("cleanup failed");
    store
        .clean_up_unreferenced_resource_configs(100)
        .await
        .expect("config collection failed");
    let collected = store
        .clean_up_unreferenced_resource_caches(100)
        .await
        .expect("collection failed");
    assert_eq!(collected, 1);

    assert!(store
        .find_resource_cache_by_id(cache_a.id)
        .await
        .expect("lookup failed")
        .is_none());
}
