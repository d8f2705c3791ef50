//! End-to-end scenarios from spec.md §8, run against an in-process mock
//! transport standing in for an S3-compatible bucket.

use std::sync::Arc;

use ebooklet::{Database, Error, OpenFlag, OpenOptions, ReadOnly, ReadWrite, RESERVED_METADATA_KEY};
use remote_storage::mock::MockTransport;

#[tokio::test]
async fn fresh_create_and_push() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));
    let path = dir.path().join("a.blt");

    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(&path, "db/fresh", Arc::clone(&transport))
        .await
        .unwrap();

    db.set("a", b"1".to_vec()).unwrap();
    db.set("b", b"2".to_vec()).unwrap();
    db.push(false).await.unwrap();

    assert!(transport.head_db_object_for_test("db/fresh").await);
    assert!(transport.has_object_for_test("db/fresh/a"));
    assert!(transport.has_object_for_test("db/fresh/b"));
}

#[tokio::test]
async fn pull_on_fresh_client() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut writer: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("writer.blt"), "db/pull", Arc::clone(&transport))
        .await
        .unwrap();
    writer.set("a", b"1".to_vec()).unwrap();
    writer.set("b", b"2".to_vec()).unwrap();
    writer.push(false).await.unwrap();
    let writer_uuid = writer.uuid();

    let mut reader: Database<_, ReadOnly> = OpenOptions::new()
        .flag(OpenFlag::Read)
        .open(dir.path().join("reader.blt"), "db/pull", Arc::clone(&transport))
        .await
        .unwrap();

    assert_eq!(reader.get("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(reader.uuid(), writer_uuid);
    reader.pull().await.unwrap();
    assert_eq!(reader.len(), 2);
}

#[tokio::test]
async fn last_writer_wins() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut x: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("x.blt"), "db/lww", Arc::clone(&transport))
        .await
        .unwrap();
    x.set("k", b"1".to_vec()).unwrap();
    x.push(false).await.unwrap();

    let mut y: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::Read)
        .open(dir.path().join("y.blt"), "db/lww", Arc::clone(&transport))
        .await
        .unwrap();
    y.pull().await.unwrap();
    y.set("k", b"2".to_vec()).unwrap();
    y.push(false).await.unwrap();

    let mut reader: Database<_, ReadOnly> = OpenOptions::new()
        .flag(OpenFlag::Read)
        .open(dir.path().join("reader.blt"), "db/lww", Arc::clone(&transport))
        .await
        .unwrap();
    assert_eq!(reader.get("k").await.unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
async fn grouped_upload_tracks_deletes() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .num_groups(4)
        .open(dir.path().join("grouped.blt"), "db/grouped", Arc::clone(&transport))
        .await
        .unwrap();

    for i in 0..100 {
        db.set(&format!("key{i}"), i.to_string().into_bytes()).unwrap();
    }
    db.push(false).await.unwrap();
    assert!(transport.object_count_under_for_test("db/grouped") <= 5); // <=4 groups + header

    for i in 0..50 {
        db.del(&format!("key{i}")).unwrap();
    }
    db.push(false).await.unwrap();
    assert_eq!(db.len(), 50);
}

#[tokio::test]
async fn partial_push_recovery() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("partial.blt"), "db/partial", Arc::clone(&transport))
        .await
        .unwrap();
    db.set("a", b"1".to_vec()).unwrap();
    db.set("b", b"2".to_vec()).unwrap();

    transport.fail_next_put_for_test("db/partial/b");
    let err = db.push(false).await.unwrap_err();
    match err {
        Error::PartialPushFailure { failed_keys } => assert_eq!(failed_keys, vec!["b".to_string()]),
        other => panic!("expected PartialPushFailure, got {other:?}"),
    }

    db.push(false).await.unwrap();
    assert!(transport.has_object_for_test("db/partial/b"));
}

#[tokio::test]
async fn uuid_mismatch_detected_before_any_remote_io() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut first: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("first.blt"), "db/uuid", Arc::clone(&transport))
        .await
        .unwrap();
    first.set("a", b"1".to_vec()).unwrap();
    first.push(false).await.unwrap();

    // A second, independently-created local file pointed at the same path
    // under `Write` mode (not `New`) collides with the already-written
    // uuid once the remote is consulted.
    let second_path = dir.path().join("first.blt");
    std::fs::remove_file(&second_path).unwrap();
    let _unrelated = booklet::Store::open(&second_path, booklet::OpenMode::New, 1009, 1 << 16, None).unwrap();
    drop(_unrelated);

    let result: ebooklet::Result<Database<_, ReadWrite>> = OpenOptions::new()
        .flag(OpenFlag::Write)
        .open(second_path, "db/uuid", Arc::clone(&transport))
        .await;
    assert!(matches!(result, Err(Error::UuidMismatch { .. })));
}

#[tokio::test]
async fn set_rejects_reserved_metadata_key() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));
    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("reserved.blt"), "db/reserved", Arc::clone(&transport))
        .await
        .unwrap();

    let err = db.set(RESERVED_METADATA_KEY, b"nope".to_vec()).unwrap_err();
    assert!(matches!(err, Error::ReservedKey(ref k) if k == RESERVED_METADATA_KEY));
}

#[tokio::test]
async fn update_sets_every_pair() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));
    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("update.blt"), "db/update", Arc::clone(&transport))
        .await
        .unwrap();

    db.update(vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())])
        .unwrap();
    assert_eq!(db.get_local("a"), Some(b"1".as_slice()));
    assert_eq!(db.get_local("b"), Some(b"2".as_slice()));
}

#[tokio::test]
async fn clear_local_only_leaves_remote_untouched() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("clear.blt"), "db/clear", Arc::clone(&transport))
        .await
        .unwrap();
    db.set("a", b"1".to_vec()).unwrap();
    db.push(false).await.unwrap();

    db.clear(true).unwrap();
    assert_eq!(db.get_local("a"), None);
    db.push(false).await.unwrap();
    assert!(transport.has_object_for_test("db/clear/a"));
}

#[tokio::test]
async fn clear_non_local_only_stages_remote_deletes() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("clear_remote.blt"), "db/clear_remote", Arc::clone(&transport))
        .await
        .unwrap();
    db.set("a", b"1".to_vec()).unwrap();
    db.push(false).await.unwrap();

    db.clear(false).unwrap();
    db.push(false).await.unwrap();
    assert!(!transport.has_object_for_test("db/clear_remote/a"));
    assert_eq!(db.len(), 0);
}

#[tokio::test]
async fn values_items_timestamps_and_get_items_pull_on_read() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));

    let mut writer: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("iter_writer.blt"), "db/iter", Arc::clone(&transport))
        .await
        .unwrap();
    writer.set("a", b"1".to_vec()).unwrap();
    writer.set("b", b"2".to_vec()).unwrap();
    writer.push(false).await.unwrap();

    let mut reader: Database<_, ReadOnly> = OpenOptions::new()
        .flag(OpenFlag::Read)
        .open(dir.path().join("iter_reader.blt"), "db/iter", Arc::clone(&transport))
        .await
        .unwrap();

    let mut values = reader.values().await.unwrap();
    values.sort();
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);

    let mut items = reader.items().await.unwrap();
    items.sort();
    assert_eq!(items, vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())]);

    let timestamps = reader.timestamps(true).await.unwrap();
    assert_eq!(timestamps.len(), 2);
    assert!(timestamps.iter().all(|(_, ts, value)| *ts > 0 && value.is_some()));

    let fetched = reader.get_items(&["a".to_string(), "missing".to_string()]).await.unwrap();
    assert_eq!(fetched[0], ("a".to_string(), Some(b"1".to_vec())));
    assert_eq!(fetched[1], ("missing".to_string(), None));
}

#[tokio::test]
async fn close_flushes_and_succeeds_for_either_force_value() {
    let dir = camino_tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new(true));
    let mut db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("close.blt"), "db/close", Arc::clone(&transport))
        .await
        .unwrap();
    db.set("a", b"1".to_vec()).unwrap();
    db.close(false).unwrap();

    let db: Database<_, ReadWrite> = OpenOptions::new()
        .flag(OpenFlag::Write)
        .open(dir.path().join("close.blt"), "db/close", Arc::clone(&transport))
        .await
        .unwrap();
    assert_eq!(db.get_local("a"), Some(b"1".as_slice()));
    db.close(true).unwrap();
}
