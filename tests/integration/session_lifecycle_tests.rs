//! End-to-end session lifecycle against the scripted engine.
//!
//! Validates:
//! - Completion with recovered digests and result queries
//! - Keyspace exhaustion without recoveries
//! - Priority admission under a concurrency limit of one
//! - A resume at full capacity waits without a slot and is admitted before
//!   queued jobs
//! - Pause with checkpoint, then resume from it with monotonic progress
//! - An engine ignoring the checkpoint request is killed after the grace
//!   period and still ends up paused
//! - Cancellation of queued, running, and paused sessions

use std::time::Duration;

use crackq::engine::potfile::PotEntry;
use crackq::models::event::EventPayload;
use crackq::models::session::SessionState;
use crackq::orchestrator::broadcaster::{Delivery, SubscriptionFilter};
use crackq::orchestrator::coordinator::Coordinator;
use crackq::AppError;

use super::test_helpers::{
    dictionary_job, wait_for_state, wait_until, TestEnv, CRACKING_ENGINE, EXHAUSTING_ENGINE,
    LOOP_ENGINE, STUBBORN_ENGINE, TARGET_HASH,
};

#[tokio::test]
async fn cracking_job_completes_with_results() {
    let env = TestEnv::new(CRACKING_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");
    let mut events = orch.subscribe(SubscriptionFilter::All);

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_for_state(&orch, &id, SessionState::Completed).await;

    assert!(view.recovered);
    assert_eq!(view.generation, 1);
    assert!((view.percent - 100.0).abs() < f64::EPSILON);

    let results = orch.results(&id).await.expect("results");
    assert_eq!(
        results,
        vec![PotEntry {
            hash: TARGET_HASH.into(),
            plain: "password".into(),
        }]
    );

    // Inline targets are cleaned up; the potfile stays for queries.
    assert!(!env.session_dir(&id).join("target.hashes").exists());
    assert!(env.session_dir(&id).join("engine.potfile").exists());

    let mut saw_recovered = false;
    while let Ok(Some(Delivery::Event(event))) =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        if let EventPayload::Recovered { ref plain, .. } = event.payload {
            assert_eq!(plain, "password");
            saw_recovered = true;
        }
    }
    assert!(saw_recovered, "Recovered event should be published");

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn exhausted_keyspace_completes_without_recovery() {
    let env = TestEnv::new(EXHAUSTING_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let view = wait_for_state(&orch, &id, SessionState::Completed).await;

    assert!(!view.recovered);
    assert!(view.failure.is_none());
    assert!(orch.results(&id).await.expect("results").is_empty());

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn invalid_job_is_rejected_before_a_session_exists() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let mut job = dictionary_job(None);
    job.wordlists = vec!["../../etc/passwd".into()];
    let err = orch.submit(job).await.expect_err("invalid");
    assert!(matches!(err, AppError::InvalidJobSpec(_)));
    assert!(orch.list().await.expect("list").is_empty());

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn concurrency_limit_queues_by_priority() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let first = orch.submit(dictionary_job(None)).await.expect("submit");
    let second = orch.submit(dictionary_job(None)).await.expect("submit");
    let urgent = orch.submit(dictionary_job(Some(5))).await.expect("submit");

    wait_for_state(&orch, &first, SessionState::Running).await;
    let second_view = orch.get(&second).await.expect("get");
    let urgent_view = orch.get(&urgent).await.expect("get");
    assert_eq!(second_view.state, SessionState::Queued);
    assert_eq!(urgent_view.queue_position, Some(0));
    assert_eq!(second_view.queue_position, Some(1));

    orch.cancel(&first).await.expect("cancel running");
    wait_for_state(&orch, &first, SessionState::Cancelled).await;
    wait_for_state(&orch, &urgent, SessionState::Running).await;
    assert_eq!(
        orch.get(&second).await.expect("get").state,
        SessionState::Queued
    );

    // A queued session is cancelled without ever running.
    orch.cancel(&second).await.expect("cancel queued");
    let view = orch.get(&second).await.expect("get");
    assert_eq!(view.state, SessionState::Cancelled);
    assert_eq!(view.generation, 0);

    let err = orch.cancel(&second).await.expect_err("already terminal");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    orch.cancel(&urgent).await.expect("cancel");
    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn waiting_resume_is_admitted_before_queued_jobs() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let resumed = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &resumed, "progress", |v| v.percent >= 1.0).await;
    orch.pause(&resumed).await.expect("pause");
    wait_for_state(&orch, &resumed, SessionState::Paused).await;

    let holder = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_for_state(&orch, &holder, SessionState::Running).await;
    let queued = orch.submit(dictionary_job(Some(10))).await.expect("submit");

    // The only slot is taken: the resume is validated and waits.
    orch.resume(&resumed).await.expect("resume");
    let waiting = orch.get(&resumed).await.expect("get");
    assert_eq!(waiting.state, SessionState::Resuming);
    assert_eq!(waiting.generation, 1);
    assert_eq!(waiting.queue_position, Some(0));

    orch.cancel(&holder).await.expect("cancel");
    wait_until(&orch, &resumed, "restored run", |v| {
        v.state == SessionState::Running && v.generation == 2
    })
    .await;
    assert_eq!(
        orch.get(&queued).await.expect("get").state,
        SessionState::Queued
    );

    orch.cancel(&queued).await.expect("cancel");
    orch.cancel(&resumed).await.expect("cancel");
    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn pause_and_resume_continue_from_checkpoint() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    let mut events = orch.subscribe(SubscriptionFilter::Session(id.clone()));
    wait_until(&orch, &id, "progress", |v| v.percent >= 3.0).await;

    let err = orch.resume(&id).await.expect_err("running cannot resume");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    orch.pause(&id).await.expect("pause");
    let paused = wait_for_state(&orch, &id, SessionState::Paused).await;
    assert!(env.session_dir(&id).join("checkpoint.json").exists());
    assert!(env.session_dir(&id).join("engine.restore").exists());

    let err = orch.pause(&id).await.expect_err("paused cannot pause");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    orch.resume(&id).await.expect("resume");
    let resumed = wait_until(&orch, &id, "resumed progress", |v| {
        v.state == SessionState::Running && v.generation == 2 && v.percent > paused.percent
    })
    .await;
    assert!(resumed.percent > paused.percent);

    orch.cancel(&id).await.expect("cancel");
    wait_for_state(&orch, &id, SessionState::Cancelled).await;

    // Progress never went backwards across the pause.
    let mut last = 0.0_f64;
    let mut states = Vec::new();
    while let Ok(Some(delivery)) =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        match delivery {
            Delivery::Event(event) => match event.payload {
                EventPayload::Progress(snapshot) => {
                    assert!(snapshot.percent >= last, "progress regressed");
                    last = snapshot.percent;
                }
                EventPayload::StateChanged { to, .. } => states.push(to),
                _ => {}
            },
            Delivery::Gap { .. } => {}
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Paused,
            SessionState::Resuming,
            SessionState::Running,
            SessionState::Cancelled,
        ]
    );

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn pause_escalates_to_kill_after_grace_period() {
    let env = TestEnv::new(STUBBORN_ENGINE, "grace_period_seconds = 1");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &id, "progress", |v| v.percent >= 1.0).await;

    let requested = tokio::time::Instant::now();
    orch.pause(&id).await.expect("pause");
    let view = wait_for_state(&orch, &id, SessionState::Paused).await;

    assert!(requested.elapsed() >= Duration::from_millis(900));
    assert!(view.failure.is_none());
    assert!(env.session_dir(&id).join("checkpoint.json").exists());

    orch.cancel(&id).await.expect("cancel");
    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn paused_session_can_be_cancelled() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    let id = orch.submit(dictionary_job(None)).await.expect("submit");
    wait_until(&orch, &id, "progress", |v| v.percent >= 1.0).await;
    orch.pause(&id).await.expect("pause");
    wait_for_state(&orch, &id, SessionState::Paused).await;

    orch.cancel(&id).await.expect("cancel");
    assert_eq!(
        orch.get(&id).await.expect("get").state,
        SessionState::Cancelled
    );
    assert!(!env.session_dir(&id).join("checkpoint.json").exists());

    orch.shutdown().await;
    task.await.expect("coordinator task");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let env = TestEnv::new(LOOP_ENGINE, "");
    let (orch, task) = Coordinator::start(env.config.clone(), env.repo().await)
        .await
        .expect("start");

    for result in [
        orch.pause("nope").await,
        orch.resume("nope").await,
        orch.cancel("nope").await,
    ] {
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
    assert!(matches!(orch.get("nope").await, Err(AppError::NotFound(_))));

    orch.shutdown().await;
    task.await.expect("coordinator task");
}
