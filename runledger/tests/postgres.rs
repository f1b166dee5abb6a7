//! The same ledger operations against PostgreSQL.
//!
//! Requires a running Postgres instance. Tests share the ledger tables and
//! truncate them first, so run single-threaded:
//! `DATABASE_URL=postgres://... cargo test --test postgres -- --ignored --test-threads=1`

use std::sync::Arc;

use futures::future::join_all;
use runledger::*;
use runledger_testkit::*;

async fn open() -> Ledger {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at Postgres");
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = TestLedger::config_for(dir.path());
    config.persistence.connection_string = url;
    config.work_dir = std::env::temp_dir().join("runledger-pg-markers");

    let ledger = Ledger::open(&config).await.expect("open postgres ledger");
    assert_eq!(ledger.dialect(), Dialect::Postgres);
    sqlx::query("TRUNCATE ledger_jobs, ledger_job_summary")
        .execute(&ledger.pools().pool())
        .await
        .expect("truncate");
    ledger.cache().invalidate_all();
    ledger
}

#[tokio::test]
#[ignore]
async fn test_postgres_lifecycle() {
    let ledger = open().await;

    let job = ledger.create(new_job("abc12345")).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(ledger.get(&job.id).await.unwrap(), Some(job.clone()));

    ledger
        .update_status(&job.id, JobStatus::Training, None, None)
        .await
        .unwrap();
    ledger.set_progress(&job.id, 50, None).await.unwrap();
    ledger
        .update_status(&job.id, JobStatus::Done, None, Some("/runs/abc12345".into()))
        .await
        .unwrap();

    let done = ledger.get(&job.id).await.unwrap().unwrap();
    assert_eq!(done.success, Some(true));
    assert!(done.duration_seconds.is_some());

    let stats = ledger.overall_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(ledger.recent_jobs(5).await.unwrap().len(), 1);

    let err = ledger.create(new_job("abc12345")).await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
}

#[tokio::test]
#[ignore]
async fn test_postgres_concurrent_updates() {
    let ledger = Arc::new(open().await);
    let job = ledger.create(new_job("abc12345")).await.unwrap();
    ledger
        .update_status(&job.id, JobStatus::Training, None, None)
        .await
        .unwrap();

    let tasks = (0..20).map(|i| {
        let ledger = Arc::clone(&ledger);
        let id = job.id.clone();
        tokio::spawn(async move { ledger.set_progress(&id, i, None).await })
    });
    for result in join_all(tasks.collect::<Vec<_>>()).await {
        assert!(result.unwrap().unwrap());
    }

    let version = ledger.get(&job.id).await.unwrap().unwrap().version();
    let err = ledger
        .update_if_version(&job.id, JobVersion(version.0 - 1), JobPatch::status(JobStatus::Done))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VersionConflict { .. }));
}
