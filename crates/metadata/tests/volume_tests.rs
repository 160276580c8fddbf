//! Volume lifecycle, parent/child constraints, and cache blessing.

mod common;

use capstan_metadata::models::{VolumeType, WorkerState};
use capstan_metadata::repos::*;
use capstan_metadata::MetadataError;
use common::fixtures::*;
use common::TestStore;
use time::OffsetDateTime;

#[tokio::test]
async fn test_volume_lifecycle_is_idempotent() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let volume = store
        .create_container_volume("worker-1", container.id, "/tmp/build", Some(1))
        .await
        .expect("create failed");
    assert_eq!(volume.state, "creating");
    assert_eq!(volume.volume_type(), VolumeType::Container);

    store.volume_created(volume.id).await.expect("created failed");
    store
        .volume_created(volume.id)
        .await
        .expect("created retry failed");

    store
        .volume_destroying(volume.id)
        .await
        .expect("destroying failed");

    let err = store
        .volume_created(volume.id)
        .await
        .expect_err("expected an error");
    assert!(matches!(err, MetadataError::VolumeMarkCreatedFailed(_)));

    assert!(store.destroy_volume(volume.id).await.expect("destroy failed"));
    assert!(!store.destroy_volume(volume.id).await.expect("destroy retry failed"));

    let err = store
        .volume_created(volume.id)
        .await
        .expect_err("expected an error");
    assert!(matches!(err, MetadataError::VolumeMissing(_)));
}

#[tokio::test]
async fn test_parent_cannot_be_destroyed_with_children_present() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let parent = created_container_volume(&store, "worker-1", container.id).await;

    let child = store
        .create_child_volume(parent.id, container.id, "/tmp/build/sub")
        .await
        .expect("child create failed");
    store.volume_created(child.id).await.expect("created failed");

    let err = store
        .volume_destroying(parent.id)
        .await
        .expect_err("expected an error");
    assert!(matches!(
        err,
        MetadataError::VolumeCannotBeDestroyedWithChildrenPresent(_)
    ));

    store
        .volume_destroying(child.id)
        .await
        .expect("child destroying failed");
    assert!(store.destroy_volume(child.id).await.expect("destroy failed"));

    store
        .volume_destroying(parent.id)
        .await
        .expect("parent destroying failed after child removal");
}

#[tokio::test]
async fn test_child_requires_created_parent() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let parent = store
        .create_container_volume("worker-1", container.id, "/tmp/build", Some(1))
        .await
        .expect("create failed");

    // parent is still creating
    assert!(store
        .create_child_volume(parent.id, container.id, "/tmp/build/sub")
        .await
        .is_err());
}

#[tokio::test]
async fn test_initialize_resource_cache_blesses_one_volume() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let cache = git_cache(&store, build.id).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let volume = created_container_volume(&store, "worker-1", container.id).await;

    let placement = store
        .initialize_resource_cache(volume.id, cache.id)
        .await
        .expect("initialize failed")
        .expect("volume should be blessed");
    assert_eq!(placement.worker_name, "worker-1");
    assert_eq!(placement.resource_cache_id, cache.id);
    assert_eq!(
        placement.worker_base_resource_type_id,
        Some(capability_id(&store, "worker-1", "git").await)
    );

    let blessed = store
        .find_volume_by_handle(&volume.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert_eq!(blessed.worker_resource_cache_id, Some(placement.id));
    assert_eq!(blessed.team_id, None);
    assert_eq!(blessed.volume_type(), VolumeType::Resource);

    // a second fetch of the same cache loses the race and stays a
    // container volume
    let loser = created_container_volume(&store, "worker-1", container.id).await;
    let result = store
        .initialize_resource_cache(loser.id, cache.id)
        .await
        .expect("initialize failed");
    assert!(result.is_none());

    let loser = store
        .find_volume_by_handle(&loser.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert_eq!(loser.worker_resource_cache_id, None);
    assert_eq!(loser.volume_type(), VolumeType::Container);

    // the blessed volume is discoverable through the placement
    let found = store
        .find_resource_cache_volume("worker-1", cache.id, OffsetDateTime::now_utc())
        .await
        .expect("find failed")
        .expect("no cache volume");
    assert_eq!(found.id, volume.id);
}

#[tokio::test]
async fn test_streamed_cache_uses_destination_capability() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    register_worker(&store, "worker-2").await;
    let build = started_build(&store).await;
    let cache = git_cache(&store, build.id).await;

    // cache is materialized on worker-1
    let container_one = created_container(&store, "worker-1", build.id).await;
    let volume_one = created_container_volume(&store, "worker-1", container_one.id).await;
    let placement_one = store
        .initialize_resource_cache(volume_one.id, cache.id)
        .await
        .expect("initialize failed")
        .expect("volume should be blessed");

    // streamed to worker-2 and re-identified there
    let container_two = created_container(&store, "worker-2", build.id).await;
    let volume_two = created_container_volume(&store, "worker-2", container_two.id).await;
    let placement_two = store
        .initialize_streamed_resource_cache(volume_two.id, cache.id, placement_one.id)
        .await
        .expect("initialize failed")
        .expect("streamed volume should be blessed");

    assert_ne!(placement_one.id, placement_two.id);
    assert_eq!(
        placement_two.worker_base_resource_type_id,
        Some(capability_id(&store, "worker-2", "git").await)
    );

    // invalidating the source placement does not touch the destination
    store
        .save_worker(
            "worker-1",
            WorkerState::Running,
            false,
            &[WorkerResourceTypeSpec::new("git", GIT_IMAGE, "2.0")],
        )
        .await
        .expect("re-register failed");

    assert!(store
        .find_worker_resource_cache("worker-2", cache.id, OffsetDateTime::now_utc())
        .await
        .expect("find failed")
        .is_some());
}

#[tokio::test]
async fn test_streamed_cache_declines_invalidated_source() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    register_worker(&store, "worker-2").await;
    let build = started_build(&store).await;
    let cache = git_cache(&store, build.id).await;

    let container_one = created_container(&store, "worker-1", build.id).await;
    let volume_one = created_container_volume(&store, "worker-1", container_one.id).await;
    let placement_one = store
        .initialize_resource_cache(volume_one.id, cache.id)
        .await
        .expect("initialize failed")
        .expect("volume should be blessed");

    // the source capability is replaced mid-stream
    store
        .save_worker(
            "worker-1",
            WorkerState::Running,
            false,
            &[WorkerResourceTypeSpec::new("git", GIT_IMAGE, "2.0")],
        )
        .await
        .expect("re-register failed");

    let container_two = created_container(&store, "worker-2", build.id).await;
    let volume_two = created_container_volume(&store, "worker-2", container_two.id).await;
    let result = store
        .initialize_streamed_resource_cache(volume_two.id, cache.id, placement_one.id)
        .await
        .expect("initialize failed");

    // not an error: the volume keeps its bytes, it just isn't a cache
    assert!(result.is_none());
    let volume_two = store
        .find_volume_by_handle(&volume_two.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert_eq!(volume_two.worker_resource_cache_id, None);
}

#[tokio::test]
async fn test_initialize_task_cache_detaches_previous_volume() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let first = created_container_volume(&store, "worker-1", container.id).await;
    assert!(store
        .initialize_task_cache(first.id, 7, "unit", "vendor/cache")
        .await
        .expect("initialize failed"));

    let first_row = store
        .find_volume_by_handle(&first.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert!(first_row.worker_task_cache_id.is_some());
    assert_eq!(first_row.volume_type(), VolumeType::TaskCache);

    // a newer run replaces the cache volume; the old one is released for GC
    let second = created_container_volume(&store, "worker-1", container.id).await;
    assert!(store
        .initialize_task_cache(second.id, 7, "unit", "vendor/cache")
        .await
        .expect("initialize failed"));

    let first_row = store
        .find_volume_by_handle(&first.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert!(first_row.worker_task_cache_id.is_none());

    let second_row = store
        .find_volume_by_handle(&second.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert!(second_row.worker_task_cache_id.is_some());
}

#[tokio::test]
async fn test_initialize_artifact() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;
    let volume = created_container_volume(&store, "worker-1", container.id).await;

    let artifact = store
        .initialize_artifact(volume.id, "dist", Some(build.id))
        .await
        .expect("initialize failed");
    assert_eq!(artifact.name, "dist");

    let row = store
        .find_volume_by_handle(&volume.handle)
        .await
        .expect("find failed")
        .expect("volume gone");
    assert_eq!(row.worker_artifact_id, Some(artifact.id));
}

#[tokio::test]
async fn test_base_resource_type_volume() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    let capability = capability_id(&store, "worker-1", "git").await;
    let volume = store
        .create_base_resource_type_volume(capability, None)
        .await
        .expect("create failed");
    assert_eq!(volume.worker_name, "worker-1");
    assert_eq!(volume.volume_type(), VolumeType::ResourceType);
}

#[tokio::test]
async fn test_orphaned_volume_sweep_respects_children_and_stalled_workers() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let parent = created_container_volume(&store, "worker-1", container.id).await;
    let child = store
        .create_child_volume(parent.id, container.id, "/tmp/build/sub")
        .await
        .expect("child create failed");
    store.volume_created(child.id).await.expect("created failed");

    // deleting the container orphans both volumes (owner reference nulls)
    store
        .container_destroying(container.id)
        .await
        .expect("destroying failed");
    store
        .destroy_container(container.id)
        .await
        .expect("destroy failed");

    let orphaned = store.find_orphaned_volumes().await.expect("find failed");
    assert_eq!(orphaned.len(), 2);

    // the parent is skipped while the child exists
    let moved = store.destroy_orphaned_volumes().await.expect("sweep failed");
    assert_eq!(moved, 1);
    assert!(store.destroy_volume(child.id).await.expect("destroy failed"));

    let moved = store.destroy_orphaned_volumes().await.expect("sweep failed");
    assert_eq!(moved, 1);

    // a stalled worker's volumes are presumed present and left alone
    let build_two = started_build(&store).await;
    let container_two = created_container(&store, "worker-1", build_two.id).await;
    created_container_volume(&store, "worker-1", container_two.id).await;
    store
        .container_destroying(container_two.id)
        .await
        .expect("destroying failed");
    store
        .destroy_container(container_two.id)
        .await
        .expect("destroy failed");

    store
        .set_worker_state("worker-1", WorkerState::Stalled)
        .await
        .expect("stall failed");
    assert!(store
        .find_orphaned_volumes()
        .await
        .expect("find failed")
        .is_empty());
}

#[tokio::test]
async fn test_missing_volume_sweep() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let v1 = created_container_volume(&store, "worker-1", container.id).await;
    let v2 = created_container_volume(&store, "worker-1", container.id).await;

    store
        .update_volumes_missing_since("worker-1", &[v1.handle.clone()])
        .await
        .expect("sweep failed");

    let (missing,): (Option<String>,) =
        sqlx::query_as("SELECT missing_since FROM volumes WHERE id = ?")
            .bind(v2.id)
            .fetch_one(store.pool())
            .await
            .expect("select failed");
    assert!(missing.is_some());

    let removed = store
        .remove_missing_volumes(time::Duration::ZERO)
        .await
        .expect("remove failed");
    assert_eq!(removed, 1);

    assert!(store
        .find_volume_by_handle(&v2.handle)
        .await
        .expect("find failed")
        .is_none());
    assert!(store
        .find_volume_by_handle(&v1.handle)
        .await
        .expect("find failed")
        .is_some());
}

#[tokio::test]
async fn test_unknown_and_failed_volume_sweeps() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;
    let container = created_container(&store, "worker-1", build.id).await;

    let inserted = store
        .destroy_unknown_volumes("worker-1", &["phantom-volume".to_string()])
        .await
        .expect("sweep failed");
    assert_eq!(inserted, 1);

    let handles = store
        .find_destroying_volume_handles("worker-1")
        .await
        .expect("handles failed");
    assert_eq!(handles, vec!["phantom-volume".to_string()]);

    let removed = store
        .remove_destroying_volumes("worker-1", &[])
        .await
        .expect("reconcile failed");
    assert_eq!(removed, 1);

    let failed = store
        .create_container_volume("worker-1", container.id, "/tmp/scratch", None)
        .await
        .expect("create failed");
    store.volume_failed(failed.id).await.expect("failed failed");

    let removed = store.destroy_failed_volumes().await.expect("sweep failed");
    assert_eq!(removed, 1);
}
