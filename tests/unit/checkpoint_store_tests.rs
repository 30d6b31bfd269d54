//! Unit tests for the file-backed checkpoint store.

use std::time::Duration;

use chrono::Utc;

use crackq::models::checkpoint::CheckpointRecord;
use crackq::models::session::SessionState;
use crackq::orchestrator::checkpoint_store::{restore_file_mtime, write_atomic, CheckpointStore};
use crackq::AppError;

fn store(dir: &tempfile::TempDir) -> CheckpointStore {
    CheckpointStore::new(dir.path().join("sessions"), Duration::from_secs(5))
}

fn sealed(store: &CheckpointStore, session_id: &str) -> CheckpointRecord {
    let restore = store.paths(session_id).restore_file;
    std::fs::create_dir_all(restore.parent().expect("parent")).expect("mkdir");
    std::fs::write(&restore, b"engine state").expect("restore file");
    CheckpointRecord::new(
        session_id.into(),
        "job-1".into(),
        restore.clone(),
        restore_file_mtime(&restore),
        None,
        SessionState::Paused,
    )
    .expect("record")
}

#[tokio::test]
async fn save_then_load_returns_same_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let record = sealed(&store, "s1");

    store.save("s1", &record).await.expect("save");
    let loaded = store.load("s1").await.expect("load");
    assert_eq!(loaded, record);
}

#[tokio::test]
async fn save_overwrites_previous_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let first = sealed(&store, "s1");
    store.save("s1", &first).await.expect("save");

    let mut second = first.clone();
    second.state = SessionState::Running;
    second.checksum = second.compute_checksum().expect("checksum");
    store.save("s1", &second).await.expect("save");

    assert_eq!(store.load("s1").await.expect("load").state, SessionState::Running);
}

#[tokio::test]
async fn missing_record_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = store(&dir).load("absent").await.expect_err("no record");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn unreadable_record_is_corrupt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let path = store.paths("s1").checkpoint_file;
    write_atomic(&path, b"{ not json").expect("write");

    let err = store.load("s1").await.expect_err("corrupt");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
}

#[tokio::test]
async fn tampered_record_fails_checksum() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let mut record = sealed(&store, "s1");
    record.job_id = "other-job".into();
    store.save("s1", &record).await.expect("save");

    let err = store.load("s1").await.expect_err("checksum mismatch");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
}

#[tokio::test]
async fn record_for_another_session_is_corrupt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let record = sealed(&store, "s1");
    store.save("s2", &record).await.expect("save");

    let err = store.load("s2").await.expect_err("wrong owner");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
}

#[tokio::test]
async fn missing_restore_file_is_corrupt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let record = sealed(&store, "s1");
    store.save("s1", &record).await.expect("save");
    std::fs::remove_file(&record.restore_path).expect("remove restore");

    let err = store.load("s1").await.expect_err("restore missing");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
}

#[tokio::test]
async fn restore_file_older_than_record_is_corrupt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let base = sealed(&store, "s1");
    let record = CheckpointRecord::new(
        base.session_id.clone(),
        base.job_id.clone(),
        base.restore_path.clone(),
        Some(Utc::now() + chrono::Duration::hours(1)),
        None,
        SessionState::Paused,
    )
    .expect("record");
    store.save("s1", &record).await.expect("save");

    let err = store.load("s1").await.expect_err("stale restore file");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);
    let record = sealed(&store, "s1");
    store.save("s1", &record).await.expect("save");

    store.delete("s1").await.expect("delete");
    store.delete("s1").await.expect("delete again");
    assert!(!store.paths("s1").checkpoint_file.exists());
}

#[tokio::test]
async fn write_target_writes_one_hash_per_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store(&dir);

    let path = store
        .write_target("s1", &["aa".into(), "bb".into()])
        .await
        .expect("write target");
    assert_eq!(std::fs::read_to_string(path).expect("read"), "aa\nbb\n");
}
