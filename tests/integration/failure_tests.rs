//! Failure handling against the scripted engine.
//!
//! Validates:
//! - An engine that exits on its own fails the session with its exit code
//! - An engine killed from outside fails the session with no exit code
//! - A single overlong output line is tolerated and progress continues
//! - Device failures, malformed status streams, and silent engines fail
//!   the session and free the slot
//! - A corrupt checkpoint fails resume without launching the engine
//! - A missing engine binary fails the session at admission

use std::sync::Arc;

use crackq::config::GlobalConfig;
use crackq::errors::ErrorKind;
use crackq::models::session::SessionState;
use crackq::orchestrator::coordinator::Coordinator;
use crackq::AppError;

use super::test_helpers::{
    dictionary_job, wait_for_state, wait_until, TestEnv, CRASHING_ENGINE,
    DEVICE_FAILURE_ENGINE, LOOP_ENGINE, MALFORMED_ENGINE, OVERLONG_LINE_ENGINE,
    PID_LOOP_ENGINE, SILENT_ENGINE,
};

#[tokio::test]
async fn unrequested_exit_fails_with_exit_code() {
    let env = TestEnv::new(CRASHING_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_for_state(&orch, &id, SessionState::Failed).await;

    let failure = view.failure.expect("failure reason");
    assert_eq!(failure.kind, ErrorKind::UnexpectedExit);
    assert_eq!(failure.exit_code, Some(2));
    // Failed sessions keep their checkpoint for inspection.
    assert!(env.session_dir(&id).join("checkpoint.json").exists());

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn engine_killed_out_of_band_fails_without_exit_code() {
    let env = TestEnv::new(PID_LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &id, "progress", |v| v.percent >= 2.0).await;

    let pid = env.engine_pid(&id).await;
    let status = std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .expect("run kill");
    assert!(status.success());

    let view = wait_for_state(&orch, &id, SessionState::Failed).await;
    let failure = view.failure.expect("failure reason");
    assert_eq!(failure.kind, ErrorKind::UnexpectedExit);
    assert_eq!(failure.exit_code, None);
    assert!(failure.detail.contains("signal 9"), "{}", failure.detail);
    assert!(view.percent >= 2.0);

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn overlong_output_line_does_not_stall_progress() {
    let env = TestEnv::new(OVERLONG_LINE_ENGINE, "malformed_threshold = 2");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_until(&orch, &id, "progress past the long line", |v| v.percent >= 20.0).await;
    assert_eq!(view.state, SessionState::Running);
    assert!(view.failure.is_none());

    orch.cancel(&id).await.expect("cancel");
    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn device_failure_fails_session_and_frees_slot() {
    let env = TestEnv::new(DEVICE_FAILURE_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let first = orch.submit(dictionary_job(None)).await.expect("submit");
    let second = orch.submit(dictionary_job(None)).await.expect("submit");

    let view = wait_for_state(&orch, &first, SessionState::Failed).await;
    let failure = view.failure.expect("failure reason");
    assert_eq!(failure.kind, ErrorKind::DeviceError);
    assert!(failure.detail.contains("device #1"));

    // The killed engine releases its slot to the queued session.
    wait_until(&orch, &second, "second admitted", |v| {
        v.state != SessionState::Queued
    })
    .await;

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn malformed_stream_past_threshold_fails_session() {
    let env = TestEnv::new(MALFORMED_ENGINE, "malformed_threshold = 2");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_for_state(&orch, &id, SessionState::Failed).await;
    assert_eq!(
        view.failure.expect("failure").kind,
        ErrorKind::StatusStreamMalformed
    );

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn silent_engine_is_declared_unresponsive() {
    let env = TestEnv::new(SILENT_ENGINE, "inactivity_timeout_seconds = 1\nstall_limit = 1");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_for_state(&orch, &id, SessionState::Failed).await;
    let failure = view.failure.expect("failure");
    assert_eq!(failure.kind, ErrorKind::UnexpectedExit);
    assert!(failure.detail.contains("unresponsive"));

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn corrupt_checkpoint_fails_resume_without_spawning() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &id, "progress", |v| v.percent >= 1.0).await;
    orch.pause(&id).await.expect("pause");
    wait_for_state(&orch, &id, SessionState::Paused).await;

    std::fs::write(env.session_dir(&id).join("checkpoint.json"), b"{ truncated")
        .expect("corrupt checkpoint");

    let err = orch.resume(&id).await.expect_err("corrupt");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));

    let view = orch.get(&id).await.expect("get");
    assert_eq!(view.state, SessionState::Failed);
    assert_eq!(view.generation, 1, "no new engine process");
    assert_eq!(
        view.failure.expect("failure").kind,
        ErrorKind::CorruptCheckpoint
    );

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn missing_restore_file_fails_resume() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &id, "progress", |v| v.percent >= 1.0).await;
    orch.pause(&id).await.expect("pause");
    wait_for_state(&orch, &id, SessionState::Paused).await;

    std::fs::remove_file(env.session_dir(&id).join("engine.restore")).expect("remove");

    let err = orch.resume(&id).await.expect_err("restore file gone");
    assert!(matches!(err, AppError::CorruptCheckpoint(_)));
    assert_eq!(
        orch.get(&id).await.expect("get").state,
        SessionState::Failed
    );

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn missing_engine_binary_fails_at_admission() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let mut config = GlobalConfig::clone(&env.config);
    config.engine.binary = env.temp.path().join("no-such-engine");
    let (orch, task) = Coordinator::start(Arc::new(config), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = orch.get(&id).await.expect("get");
    assert_eq!(view.state, SessionState::Failed);
    assert_eq!(
        view.failure.expect("failure").kind,
        ErrorKind::ProcessSpawnFailed
    );

    orch.shutdown().await;
    task.await.expect("coordinator task");
}
