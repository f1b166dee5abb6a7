//! Concurrent writers sharing one SQLite file.
//!
//! Each `Ledger` holds a single connection, like a separate worker process.
//! With `busy_timeout = 0` every overlapping write fails with "database is
//! locked" and must be absorbed by the retry policy.

use std::sync::Arc;

use futures::future::join_all;
use runledger::*;
use runledger_testkit::*;

async fn contended() -> TestLedger {
    TestLedger::with_config(|config| {
        config.persistence.busy_timeout_ms = 0;
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_never_surface_contention() {
    let t = contended().await;
    let job = t.job_in("abc12345", JobStatus::Training).await;

    let mut writers = vec![Arc::clone(t.ledger())];
    for _ in 0..3 {
        writers.push(Arc::new(t.open_peer().await));
    }

    let tasks = writers.iter().enumerate().flat_map(|(w, ledger)| {
        let id = job.id.clone();
        (0..10).map(move |i| {
            let ledger = Arc::clone(ledger);
            let id = id.clone();
            tokio::spawn(async move { ledger.set_progress(&id, (w * 10 + i) as i64, None).await })
        })
    });

    for result in join_all(tasks.collect::<Vec<_>>()).await {
        assert!(result.expect("task panicked").expect("write eventually succeeds"));
    }

    // The last write after the storm must stick.
    let peer = &writers[2];
    assert!(peer
        .update_status(&job.id, JobStatus::Done, None, Some("/runs/final".into()))
        .await
        .unwrap());

    let done = t.get(&job.id).await;
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.output_path.as_deref(), Some("/runs/final"));
    assert!((0..40).contains(&done.current_step));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_across_writers() {
    let t = contended().await;
    let peer = Arc::new(t.open_peer().await);

    let tasks = (0..20).map(|i| {
        let ledger = if i % 2 == 0 {
            Arc::clone(t.ledger())
        } else {
            Arc::clone(&peer)
        };
        tokio::spawn(async move { ledger.create(new_job(&format!("job-{i:02}"))).await })
    });

    for result in join_all(tasks.collect::<Vec<_>>()).await {
        result.expect("task panicked").expect("create eventually succeeds");
    }

    assert_eq!(t.count().await.unwrap(), 20);
    let stats = t.overall_stats().await.unwrap();
    assert_eq!(stats.total, 20);
    assert_eq!(stats.count(JobStatus::Pending), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_transition_is_written_once() {
    let t = contended().await;
    let job = t.job_in("abc12345", JobStatus::Training).await;
    let peer = Arc::new(t.open_peer().await);
    let mut events = t.subscribe();
    let mut peer_events = peer.subscribe();

    let tasks = (0..6).map(|i| {
        let ledger = if i % 2 == 0 {
            Arc::clone(t.ledger())
        } else {
            Arc::clone(&peer)
        };
        let id = job.id.clone();
        tokio::spawn(async move {
            ledger
                .transition_if(&id, &JobStatus::ACTIVE, JobStatus::Failed, Some(format!("reaper {i}")))
                .await
        })
    });

    let wins = join_all(tasks.collect::<Vec<_>>())
        .await
        .into_iter()
        .map(|r| r.expect("task panicked").expect("transition"))
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);

    let finished = |rx: &mut tokio::sync::broadcast::Receiver<LedgerEvent>| {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e.payload, LedgerEventPayload::Finished { .. }))
            .count()
    };
    assert_eq!(finished(&mut events) + finished(&mut peer_events), 1);
    assert_eq!(t.status_of(&job.id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let t = TestLedger::with_config(|config| {
        config.persistence.busy_timeout_ms = 0;
        config.retry.max_attempts = 1;
    })
    .await;
    let job = t.job_in("abc12345", JobStatus::Training).await;

    // Hold the write lock from a raw connection so every attempt is refused.
    let pool = t.pools().pool();
    let mut blocker = pool.begin().await.unwrap();
    sqlx::query("UPDATE ledger_jobs SET current_step = current_step WHERE id = ?")
        .bind(job.id.as_str().to_string())
        .execute(&mut *blocker)
        .await
        .unwrap();

    let peer = t.open_peer().await;
    let err = peer.set_progress(&job.id, 5, None).await.unwrap_err();
    assert!(err.is_retryable(), "expected contention, got {err}");
    assert_eq!(peer.pools().stats().consecutive_errors, 1);

    blocker.rollback().await.unwrap();
    assert!(peer.set_progress(&job.id, 5, None).await.unwrap());
    assert_eq!(peer.pools().stats().consecutive_errors, 0);
}
