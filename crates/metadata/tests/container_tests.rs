//! Container lifecycle, owners, and reconciliation sweeps.

mod common;

use capstan_metadata::repos::*;
use capstan_metadata::{MetadataError, SqliteStore};
use common::fixtures::*;
use common::TestStore;
use time::{Duration, OffsetDateTime};

async fn build_container(store: &SqliteStore, worker: &str, build_id: i64) -> i64 {
    store
        .create_container(
            worker,
            &ContainerOwner::Build {
                build_id,
                plan_id: "plan-1".to_string(),
            },
            Some(1),
        )
        .await
        .expect("failed to create container")
        .id
}

#[tokio::test]
async fn test_container_lifecycle_is_idempotent() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let container = store
        .create_container(
            "worker-1",
            &ContainerOwner::Build {
                build_id: build.id,
                plan_id: "plan-1".to_string(),
            },
            Some(1),
        )
        .await
        .expect("failed to create container");
    assert_eq!(container.state, "creating");

    store
        .container_created(container.id)
        .await
        .expect("created failed");
    // retrying after a crash is a no-op success
    store
        .container_created(container.id)
        .await
        .expect("created retry failed");

    let row = store
        .find_container_by_handle(&container.handle)
        .await
        .expect("find failed")
        .expect("container gone");
    assert_eq!(row.state, "created");

    store
        .container_destroying(container.id)
        .await
        .expect("destroying failed");

    // created is no longer reachable from destroying
    let err = store
        .container_created(container.id)
        .await
        .expect_err("expected an error");
    assert!(matches!(
        err,
        MetadataError::ContainerMarkStateFailed { .. }
    ));

    assert!(store
        .destroy_container(container.id)
        .await
        .expect("destroy failed"));
    // GC winning the race is a normal outcome
    assert!(!store
        .destroy_container(container.id)
        .await
        .expect("destroy retry failed"));

    let err = store
        .container_created(container.id)
        .await
        .expect_err("expected an error");
    assert!(matches!(err, MetadataError::ContainerDisappeared(_)));
}

#[tokio::test]
async fn test_failed_containers_are_swept() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let id = build_container(&store, "worker-1", build.id).await;
    store.container_failed(id).await.expect("failed failed");

    let moved = store
        .destroy_failed_containers()
        .await
        .expect("sweep failed");
    assert_eq!(moved, 1);

    assert!(store.destroy_container(id).await.expect("destroy failed"));
}

#[tokio::test]
async fn test_build_container_orphaned_when_no_longer_interceptible() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let id = build_container(&store, "worker-1", build.id).await;
    store.container_created(id).await.expect("created failed");

    assert!(store
        .find_orphaned_containers()
        .await
        .expect("find failed")
        .is_empty());

    store
        .set_build_interceptible(build.id, false)
        .await
        .expect("set interceptible failed");

    let orphaned = store
        .find_orphaned_containers()
        .await
        .expect("find failed");
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].id, id);

    let moved = store
        .destroy_orphaned_containers()
        .await
        .expect("sweep failed");
    assert_eq!(moved, 1);

    let handles = store
        .find_destroying_container_handles("worker-1")
        .await
        .expect("handles failed");
    assert_eq!(handles.len(), 1);
}

#[tokio::test]
async fn test_image_containers_orphaned_once_owner_leaves_creating() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let step = build_container(&store, "worker-1", build.id).await;
    let check = store
        .create_container(
            "worker-1",
            &ContainerOwner::ImageCheck { container_id: step },
            Some(1),
        )
        .await
        .expect("failed to create image check container");

    // owner is still creating; the image container is justified
    assert!(store
        .find_orphaned_containers()
        .await
        .expect("find failed")
        .is_empty());

    store.container_created(step).await.expect("created failed");

    let orphaned = store
        .find_orphaned_containers()
        .await
        .expect("find failed");
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].id, check.id);
}

#[tokio::test]
async fn test_check_session_containers_orphan_on_expiry() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;

    let config = store
        .find_or_create_resource_config(&ResourceConfigDescriptor::BaseResourceType {
            name: "git".to_string(),
            source: git_source(),
        })
        .await
        .expect("config failed");
    let capability = capability_id(&store, "worker-1", "git").await;

    let session = store
        .find_or_create_check_session(
            config.id,
            capability,
            OffsetDateTime::now_utc() + Duration::minutes(5),
        )
        .await
        .expect("session failed");

    let container = store
        .create_container(
            "worker-1",
            &ContainerOwner::ResourceConfigCheckSession {
                session_id: session.id,
            },
            None,
        )
        .await
        .expect("failed to create check container");

    assert!(store
        .find_orphaned_containers()
        .await
        .expect("find failed")
        .is_empty());

    sqlx::query("UPDATE resource_config_check_sessions SET expires_at = ? WHERE id = ?")
        .bind(OffsetDateTime::now_utc() - Duration::minutes(1))
        .bind(session.id)
        .execute(store.pool())
        .await
        .expect("expire failed");

    let orphaned = store
        .find_orphaned_containers()
        .await
        .expect("find failed");
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].id, container.id);
}

#[tokio::test]
async fn test_find_container_for_owner() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let owner = ContainerOwner::Build {
        build_id: build.id,
        plan_id: "plan-1".to_string(),
    };
    let created = store
        .create_container("worker-1", &owner, Some(1))
        .await
        .expect("create failed");

    let found = store
        .find_container_for_owner("worker-1", &owner)
        .await
        .expect("find failed")
        .expect("no container");
    assert_eq!(found.id, created.id);

    let other_owner = ContainerOwner::Build {
        build_id: build.id,
        plan_id: "plan-2".to_string(),
    };
    assert!(store
        .find_container_for_owner("worker-1", &other_owner)
        .await
        .expect("find failed")
        .is_none());
}

#[tokio::test]
async fn test_missing_container_sweep() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let c1 = created_container(&store, "worker-1", build.id).await;
    let c2 = created_container(&store, "worker-1", build.id).await;

    // worker reports only the first handle
    store
        .update_containers_missing_since("worker-1", &[c1.handle.clone()])
        .await
        .expect("sweep failed");

    let (missing,): (Option<String>,) =
        sqlx::query_as("SELECT missing_since FROM containers WHERE id = ?")
            .bind(c2.id)
            .fetch_one(store.pool())
            .await
            .expect("select failed");
    assert!(missing.is_some());

    // reported again: un-marked
    store
        .update_containers_missing_since("worker-1", &[c1.handle.clone(), c2.handle.clone()])
        .await
        .expect("sweep failed");
    let (missing,): (Option<String>,) =
        sqlx::query_as("SELECT missing_since FROM containers WHERE id = ?")
            .bind(c2.id)
            .fetch_one(store.pool())
            .await
            .expect("select failed");
    assert!(missing.is_none());

    // missing again, beyond the grace period: deleted
    store
        .update_containers_missing_since("worker-1", &[c1.handle.clone()])
        .await
        .expect("sweep failed");
    let removed = store
        .remove_missing_containers(Duration::ZERO)
        .await
        .expect("remove failed");
    assert_eq!(removed, 1);

    assert!(store
        .find_container_by_handle(&c2.handle)
        .await
        .expect("find failed")
        .is_none());
    assert!(store
        .find_container_by_handle(&c1.handle)
        .await
        .expect("find failed")
        .is_some());
}

#[tokio::test]
async fn test_creating_containers_are_not_marked_missing() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let container = build_container(&store, "worker-1", build.id).await;

    store
        .update_containers_missing_since("worker-1", &[])
        .await
        .expect("sweep failed");

    let (missing,): (Option<String>,) =
        sqlx::query_as("SELECT missing_since FROM containers WHERE id = ?")
            .bind(container)
            .fetch_one(store.pool())
            .await
            .expect("select failed");
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_stalled_workers_are_exempt_from_missing_removal() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let container = created_container(&store, "worker-1", build.id).await;
    store
        .update_containers_missing_since("worker-1", &[])
        .await
        .expect("sweep failed");

    store
        .set_worker_state("worker-1", capstan_metadata::models::WorkerState::Stalled)
        .await
        .expect("stall failed");

    let removed = store
        .remove_missing_containers(Duration::ZERO)
        .await
        .expect("remove failed");
    assert_eq!(removed, 0);
    assert!(store
        .find_container_by_handle(&container.handle)
        .await
        .expect("find failed")
        .is_some());
}

#[tokio::test]
async fn test_unknown_containers_are_marked_for_destruction() {
    let test = TestStore::new().await.expect("failed to create store");
    let store = test.store();
    register_worker(&store, "worker-1").await;
    let build = started_build(&store).await;

    let known = created_container(&store, "worker-1", build.id).await;

    let inserted = store
        .destroy_unknown_containers(
            "worker-1",
            &[known.handle.clone(), "mystery-handle".to_string()],
        )
        .await
        .expect("sweep failed");
    assert_eq!(inserted, 1);

    let mystery = store
        .find_container_by_handle("mystery-handle")
        .await
        .expect("find failed")
        .expect("mystery row missing");
    assert_eq!(mystery.state, "destroying");

    // the worker finished destroying it; reconciliation removes the row
    let removed = store
        .remove_destroying_containers("worker-1", &[known.handle.clone()])
        .await
        .expect("reconcile failed");
    assert_eq!(removed, 1);
}
