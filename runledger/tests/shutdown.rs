//! Interrupt drain with scripted operator answers.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use runledger::*;
use runledger_testkit::*;
use tokio::sync::mpsc;

fn coordinator(t: &TestLedger, confirmation: &ScriptedConfirmation) -> ShutdownCoordinator {
    let mut config = t.config().shutdown.clone();
    config.confirm_timeout_seconds = 1;
    config.kill_grace_seconds = 2;
    ShutdownCoordinator::new(
        Arc::clone(t.ledger()),
        Arc::new(ProcessRegistry::new()),
        config,
        Arc::new(confirmation.clone()),
    )
}

#[tokio::test]
async fn test_declined_drain_changes_nothing() {
    let t = TestLedger::new().await;
    let training = t.job_in("abc12345", JobStatus::Training).await;
    let pending = t.create(new_job("pending1")).await.unwrap();
    t.markers().write_pid(&training.id, std::process::id()).await.unwrap();
    t.markers().touch_heartbeat(&training.id).await.unwrap();
    let markers_before = t.markers().read(&training.id).await.unwrap();

    let confirmation = ScriptedConfirmation::new([Answer::No]);
    let aux = RecordingAuxService::new("artifact-server");
    let coordinator = coordinator(&t, &confirmation).with_service(Arc::new(aux.clone()));
    coordinator.set_current_job(Some(training.id.clone()));

    let outcome = coordinator.handle_interrupt().await;
    assert!(matches!(outcome, ShutdownOutcome::Resumed));

    confirmation.assert_prompt_count_eq(1);
    let prompt = &confirmation.prompts()[0];
    assert!(prompt.contains("abc12345"));
    assert!(prompt.contains("pending1"));

    assert_eq!(t.get(&training.id).await, training);
    assert_eq!(t.get(&pending.id).await, pending);
    assert_eq!(t.markers().read(&training.id).await.unwrap(), markers_before);
    assert_eq!(aux.stop_count(), 0);
    assert_eq!(coordinator.current_job(), Some(training.id.clone()));
    assert!(!coordinator.is_in_progress());
}

#[tokio::test]
async fn test_silence_and_errors_resume() {
    let t = TestLedger::new().await;
    let job = t.job_in("abc12345", JobStatus::Training).await;

    let confirmation = ScriptedConfirmation::new([Answer::Silent, Answer::Broken]);
    let coordinator = coordinator(&t, &confirmation);

    let started = tokio::time::Instant::now();
    assert!(matches!(coordinator.handle_interrupt().await, ShutdownOutcome::Resumed));
    assert!(started.elapsed() >= Duration::from_secs(1), "waited for the timeout");

    assert!(matches!(coordinator.handle_interrupt().await, ShutdownOutcome::Resumed));
    assert_eq!(t.status_of(&job.id).await, JobStatus::Training);
}

#[tokio::test]
async fn test_confirmed_drain_cancels_and_cleans_up() {
    let t = TestLedger::new().await;
    let training = t.job_in("abc12345", JobStatus::Training).await;
    let pending = t.create(new_job("pending1")).await.unwrap();
    let done = t.job_in("done0001", JobStatus::Done).await;

    let mut child = Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .expect("spawn worker");
    let pid = child.id();
    let reaper = std::thread::spawn(move || child.wait());
    t.markers().write_pid(&training.id, pid).await.unwrap();
    t.markers().touch_heartbeat(&training.id).await.unwrap();

    let confirmation = ScriptedConfirmation::new([Answer::Yes]);
    let aux = RecordingAuxService::new("artifact-server");
    let broken = RecordingAuxService::failing("preview-server");
    let coordinator = coordinator(&t, &confirmation)
        .with_service(Arc::new(aux.clone()))
        .with_service(Arc::new(broken.clone()));
    coordinator.processes().register(training.id.clone(), pid);
    coordinator.set_current_job(Some(training.id.clone()));

    let report = match coordinator.handle_interrupt().await {
        ShutdownOutcome::Drained(report) => report,
        other => panic!("expected drain, got {other:?}"),
    };

    assert_eq!(report.cancelled, 2);
    assert_eq!(report.terminated, vec![(training.id.clone(), Termination::Terminated)]);
    assert_eq!(report.services_stopped, vec!["artifact-server".to_string()]);
    assert_eq!(report.services_failed, vec!["preview-server".to_string()]);
    assert_eq!((aux.stop_count(), broken.stop_count()), (1, 1));
    reaper.join().expect("join").expect("wait");

    for id in [&training.id, &pending.id] {
        let job = t.get(id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_message.as_deref(), Some("Cancelled by user interrupt"));
    }
    assert_eq!(t.get(&done.id).await, done);
    assert!(t.markers().read(&training.id).await.unwrap().is_empty());
    assert!(coordinator.processes().is_empty());
    assert!(coordinator.current_job().is_none());
}

#[tokio::test]
async fn test_nothing_running_drains_without_prompt() {
    let t = TestLedger::new().await;
    t.job_in("done0001", JobStatus::Done).await;

    let confirmation = ScriptedConfirmation::default();
    let outcome = coordinator(&t, &confirmation).handle_interrupt().await;

    assert!(outcome.is_drained());
    confirmation.assert_prompt_count_eq(0);
}

#[tokio::test]
async fn test_unreadable_ledger_still_prompts() {
    let t = TestLedger::new().await;
    t.job_in("abc12345", JobStatus::Training).await;
    t.close().await;

    let confirmation = ScriptedConfirmation::new([Answer::No]);
    let outcome = coordinator(&t, &confirmation).handle_interrupt().await;

    assert!(matches!(outcome, ShutdownOutcome::Resumed));
    confirmation.assert_prompt_count_eq(1);
    assert!(confirmation.prompts()[0].contains("Job ledger unavailable"));
}

#[tokio::test]
async fn test_concurrent_interrupts_are_single_flight() {
    let t = TestLedger::new().await;
    t.job_in("abc12345", JobStatus::Training).await;

    let confirmation = ScriptedConfirmation::new([Answer::Silent]);
    let coordinator = coordinator(&t, &confirmation);

    let (first, second) = tokio::join!(coordinator.handle_interrupt(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.handle_interrupt().await
    });
    assert!(matches!(first, ShutdownOutcome::Resumed));
    assert!(matches!(second, ShutdownOutcome::InProgress));
    confirmation.assert_prompt_count_eq(1);
}

#[tokio::test]
async fn test_interrupt_channel_drives_drain() {
    let t = TestLedger::new().await;
    let job = t.job_in("abc12345", JobStatus::Training).await;

    let confirmation = ScriptedConfirmation::new([Answer::No, Answer::Yes]);
    let coordinator = Arc::new(coordinator(&t, &confirmation));
    let token = ShutdownToken::new();
    let (tx, rx) = mpsc::channel(1);

    let worker = {
        let coordinator = Arc::clone(&coordinator);
        let token = token.clone();
        tokio::spawn(async move { coordinator.drain_on_interrupt(rx, token).await })
    };

    tx.send(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!token.is_cancelled(), "declined interrupt keeps running");
    assert_eq!(t.status_of(&job.id).await, JobStatus::Training);

    tx.send(()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("confirmed interrupt cancels the token");
    worker.await.unwrap();
    assert_eq!(t.status_of(&job.id).await, JobStatus::Cancelled);
}
