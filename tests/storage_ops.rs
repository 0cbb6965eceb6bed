use bucketstore::bucket::BucketId;
use bucketstore::config::{Config, TrasherConfig};
use bucketstore::storage::{Storage, StorageError};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

async fn new_storage() -> (Storage, TempDir) {
    new_storage_with_delays(60, 60).await
}

async fn new_storage_with_delays(collector: u64, worker: u64) -> (Storage, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let cfg = Config {
        root_dir: root.path().to_string_lossy().into_owned(),
        listen_addr: "127.0.0.1:0".into(),
        trasher: TrasherConfig {
            workers: 1,
            collector_iterations_delay: collector,
            worker_iterations_delay: worker,
        },
    };
    let storage = Storage::new(&cfg).await.unwrap();
    (storage, root)
}

fn bucket_id() -> BucketId {
    "00000000000000000001".parse().unwrap()
}

async fn commit_empty_bucket(storage: &Storage, id: &BucketId) {
    let reservation = storage
        .reserve_bucket(id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    reservation.commit().await.unwrap();
}

#[tokio::test]
async fn get_bucket_not_found() {
    let (storage, _root) = new_storage().await;

    let err = storage.get_bucket(&bucket_id()).await.unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(_)));

    storage.shutdown().await;
}

#[tokio::test]
async fn get_bucket_parallel_reads() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    let (path1, guard1) = storage.get_bucket(&id).await.unwrap();
    let (path2, guard2) = timeout(Duration::from_millis(200), storage.get_bucket(&id))
        .await
        .expect("second read must not wait for the first")
        .unwrap();
    assert_eq!(path1, path2);

    drop(guard1);
    drop(guard2);
    storage.shutdown().await;
}

#[tokio::test]
async fn reservation_blocks_reads_until_commit() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();

    let reservation = storage
        .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();

    // Reads and competing reservations wait on the write lock; with a
    // deadline they give up.
    let blocked_read = timeout(Duration::from_secs(1), storage.get_bucket(&id)).await;
    assert!(blocked_read.is_err());
    let blocked_reserve = timeout(
        Duration::from_millis(200),
        storage.reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1)),
    )
    .await;
    assert!(blocked_reserve.is_err());

    reservation.commit().await.unwrap();

    let (_path, guard) = timeout(Duration::from_secs(1), storage.get_bucket(&id))
        .await
        .expect("read must proceed after commit")
        .unwrap();
    drop(guard);
    storage.shutdown().await;
}

#[tokio::test]
async fn reserve_bucket_already_exists() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    let err = storage
        .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::BucketAlreadyExists(_)));

    storage.shutdown().await;
}

#[tokio::test]
async fn committed_bucket_lands_in_its_shard() {
    let (storage, root) = new_storage().await;
    let id = bucket_id();

    let reservation = storage
        .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    std::fs::write(reservation.path().join("a.txt"), b"data").unwrap();
    reservation.commit().await.unwrap();

    let (path, guard) = storage.get_bucket(&id).await.unwrap();
    assert_eq!(
        path,
        root.path()
            .join("storage")
            .join(id.shard())
            .join(id.to_string())
    );
    assert!(path.join("a.txt").exists());
    assert!(path.join(id.meta_file_name()).exists());

    drop(guard);
    storage.shutdown().await;
}

#[tokio::test]
async fn aborted_reservation_leaves_nothing() {
    let (storage, root) = new_storage().await;
    let id = bucket_id();

    let reservation = storage
        .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    let stage = reservation.path().to_path_buf();
    assert!(stage.exists());
    reservation.abort().await.unwrap();

    assert!(!stage.exists());
    assert!(!root
        .path()
        .join("storage")
        .join(id.shard())
        .join(id.to_string())
        .exists());
    let err = storage.get_bucket(&id).await.unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(_)));

    storage.shutdown().await;
}

#[tokio::test]
async fn dropped_reservation_cleans_staging_and_releases_the_lock() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();

    let stage = {
        let reservation = storage
            .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        reservation.path().to_path_buf()
    };

    assert!(!stage.exists());
    // A fresh reservation can be taken right away.
    let reservation = timeout(
        Duration::from_secs(1),
        storage.reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1)),
    )
    .await
    .expect("lock must be free after the reservation was dropped")
    .unwrap();
    reservation.abort().await.unwrap();

    storage.shutdown().await;
}

#[tokio::test]
async fn remove_bucket_is_idempotent() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();

    storage.remove_bucket(&id).await.unwrap();

    commit_empty_bucket(&storage, &id).await;
    let (path, guard) = storage.get_bucket(&id).await.unwrap();
    drop(guard);

    storage.remove_bucket(&id).await.unwrap();
    assert!(!path.exists());
    storage.remove_bucket(&id).await.unwrap();

    storage.shutdown().await;
}

#[tokio::test]
async fn bucket_meta_round_trips() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    let trash_time = Utc::now() + ChronoDuration::minutes(1);

    let reservation = storage.reserve_bucket(&id, trash_time).await.unwrap();
    reservation.commit().await.unwrap();

    let meta = storage.get_bucket_meta(&id).await.unwrap();
    assert_eq!(meta.id, id);
    assert_eq!(meta.trash_time, trash_time);

    storage.shutdown().await;
}

#[tokio::test]
async fn add_ttl_extends_the_deadline() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    let trash_time = Utc::now() + ChronoDuration::minutes(1);

    let reservation = storage.reserve_bucket(&id, trash_time).await.unwrap();
    reservation.commit().await.unwrap();

    let updated = storage
        .add_ttl(&id, ChronoDuration::minutes(10))
        .await
        .unwrap();
    assert_eq!(updated.trash_time, trash_time + ChronoDuration::minutes(10));

    let reread = storage.get_bucket_meta(&id).await.unwrap();
    assert_eq!(reread.trash_time, updated.trash_time);

    storage.shutdown().await;
}

#[tokio::test]
async fn download_is_a_noop_when_bucket_exists() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    // The endpoint is never contacted.
    storage
        .download_bucket(
            "http://127.0.0.1:1",
            &id,
            Utc::now() + ChronoDuration::minutes(1),
        )
        .await
        .unwrap();

    storage.shutdown().await;
}

#[tokio::test]
async fn reserve_file_commit_adds_the_file() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    let reservation = storage.reserve_file(&id, "sub/new.txt").await.unwrap();
    std::fs::write(reservation.path().join("sub/new.txt"), b"fresh").unwrap();
    let stage = reservation.path().to_path_buf();
    reservation.commit().await.unwrap();

    assert!(!stage.exists());
    let (bucket_path, guard) = storage.get_file(&id, "sub/new.txt").await.unwrap();
    assert_eq!(
        std::fs::read(bucket_path.join("sub/new.txt")).unwrap(),
        b"fresh"
    );
    drop(guard);

    storage.shutdown().await;
}

#[tokio::test]
async fn reserve_file_requires_the_bucket() {
    let (storage, _root) = new_storage().await;

    let err = storage
        .reserve_file(&bucket_id(), "a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(_)));

    storage.shutdown().await;
}

#[tokio::test]
async fn reserve_file_rejects_existing_file() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();

    let reservation = storage
        .reserve_bucket(&id, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    std::fs::write(reservation.path().join("a.txt"), b"x").unwrap();
    reservation.commit().await.unwrap();

    let err = storage.reserve_file(&id, "a.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::FileAlreadyExists { .. }));

    storage.shutdown().await;
}

#[tokio::test]
async fn get_file_not_found() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    let err = storage.get_file(&id, "missing.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::FileNotFound { .. }));

    storage.shutdown().await;
}

#[tokio::test]
async fn file_paths_may_not_escape_the_bucket() {
    let (storage, _root) = new_storage().await;
    let id = bucket_id();
    commit_empty_bucket(&storage, &id).await;

    for bad in ["", "/etc/passwd", "../escape", "a/../../b"] {
        let err = storage.get_file(&id, bad).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)), "accepted {bad:?}");
    }

    storage.shutdown().await;
}

#[tokio::test]
async fn reservations_on_different_ids_do_not_contend() {
    let (storage, _root) = new_storage().await;
    let a: BucketId = "00000000000000000001".parse().unwrap();
    let b: BucketId = "00000000000000000002".parse().unwrap();

    let first = storage
        .reserve_bucket(&a, Utc::now() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    let second = timeout(
        Duration::from_millis(200),
        storage.reserve_bucket(&b, Utc::now() + ChronoDuration::minutes(1)),
    )
    .await
    .expect("independent ids must not block each other")
    .unwrap();

    first.abort().await.unwrap();
    second.abort().await.unwrap();
    storage.shutdown().await;
}

#[tokio::test]
async fn expired_bucket_is_trashed() {
    let (storage, _root) = new_storage_with_delays(1, 1).await;
    let id = bucket_id();

    let reservation = storage
        .reserve_bucket(&id, Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    std::fs::write(reservation.path().join("a.txt"), b"").unwrap();
    reservation.commit().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    let err = storage.get_bucket(&id).await.unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(_)));

    storage.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_background_activity() {
    let (storage, _root) = new_storage_with_delays(1, 1).await;
    storage.shutdown().await;
    // A second shutdown has nothing left to wait for.
    storage.shutdown().await;
}
