use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::SupervisorConfig;
use crate::error::LedgerError;
use crate::job::{JobId, JobRecord, JobStatus};
use crate::markers::Markers;
use crate::store::Ledger;
use crate::telemetry;

use super::process::{OsProbe, ProcessProbe};

/// Token for signalling shutdown to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Verdict for one watched job.
#[derive(Clone, Debug, PartialEq)]
pub enum Liveness {
    Alive,
    /// Process running but its heartbeat is old. Logged, never reaped.
    Stale { last_heartbeat: DateTime<Utc> },
    Dead { reason: DeadReason, message: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeadReason {
    ProcessGone,
    HeartbeatStale,
    NoMarkers,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::ProcessGone => "process_gone",
            DeadReason::HeartbeatStale => "heartbeat_stale",
            DeadReason::NoMarkers => "no_markers",
        }
    }
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staleness thresholds used to classify a watched job.
#[derive(Clone, Copy, Debug)]
pub struct LivenessRules {
    pub heartbeat_stale: Duration,
    pub row_stale: Duration,
}

impl From<&SupervisorConfig> for LivenessRules {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            heartbeat_stale: config.heartbeat_stale(),
            row_stale: config.row_stale(),
        }
    }
}

impl LivenessRules {
    /// Classify `job` from its markers.
    ///
    /// `pid_alive` is the probe result for `markers.pid`, `None` when there is
    /// no PID marker.
    pub fn classify(
        &self,
        job: &JobRecord,
        markers: &Markers,
        pid_alive: Option<bool>,
        now: DateTime<Utc>,
    ) -> Liveness {
        let heartbeat_fresh = markers
            .heartbeat
            .map(|at| now.signed_duration_since(at) <= self.heartbeat_stale);

        match (markers.pid, pid_alive) {
            (Some(_), Some(true)) => match (markers.heartbeat, heartbeat_fresh) {
                (Some(at), Some(false)) => Liveness::Stale { last_heartbeat: at },
                _ => Liveness::Alive,
            },
            (Some(pid), _) => {
                if heartbeat_fresh == Some(true) {
                    Liveness::Alive
                } else {
                    Liveness::Dead {
                        reason: DeadReason::ProcessGone,
                        message: format!("process {pid} terminated unexpectedly"),
                    }
                }
            }
            (None, _) => match markers.heartbeat {
                Some(at) if heartbeat_fresh == Some(false) => Liveness::Dead {
                    reason: DeadReason::HeartbeatStale,
                    message: format!(
                        "worker heartbeat stale since {}",
                        at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                },
                Some(_) => Liveness::Alive,
                None if now.signed_duration_since(job.updated_at) > self.row_stale => {
                    Liveness::Dead {
                        reason: DeadReason::NoMarkers,
                        message: format!(
                            "no liveness markers and no update for {} seconds",
                            now.signed_duration_since(job.updated_at).num_seconds()
                        ),
                    }
                }
                None => Liveness::Alive,
            },
        }
    }
}

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    pub watched: usize,
    pub alive: usize,
    pub stale: Vec<JobId>,
    pub reaped: Vec<JobId>,
    /// Dead verdicts whose job had already left the active statuses.
    pub skipped: usize,
    pub errors: usize,
}

/// Background liveness sweep over active jobs.
pub struct ProcessSupervisor {
    ledger: Arc<Ledger>,
    config: SupervisorConfig,
    rules: LivenessRules,
    probe: Arc<dyn ProcessProbe>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("rules", &self.rules)
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(ledger: Arc<Ledger>, config: SupervisorConfig) -> Self {
        Self::with_probe(ledger, config, Arc::new(OsProbe))
    }

    pub fn with_probe(
        ledger: Arc<Ledger>,
        config: SupervisorConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            rules: LivenessRules::from(&config),
            ledger,
            config,
            probe,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn rules(&self) -> LivenessRules {
        self.rules
    }

    /// Check every active job once and fail the dead ones.
    pub async fn sweep(&self) -> Result<SweepReport, LedgerError> {
        let jobs = self.ledger.active_jobs().await?;
        let span = telemetry::sweep_span(jobs.len());
        self.sweep_jobs(jobs).instrument(span).await
    }

    async fn sweep_jobs(&self, jobs: Vec<JobRecord>) -> Result<SweepReport, LedgerError> {
        let mut report = SweepReport {
            watched: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let markers = match self.ledger.markers().read(&job.id).await {
                Ok(markers) => markers,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to read markers");
                    report.errors += 1;
                    continue;
                }
            };
            let pid_alive = markers.pid.map(|pid| self.probe.is_alive(pid));

            match self.rules.classify(&job, &markers, pid_alive, Utc::now()) {
                Liveness::Alive => report.alive += 1,
                Liveness::Stale { last_heartbeat } => {
                    tracing::warn!(
                        job_id = %job.id,
                        pid = ?markers.pid,
                        last_heartbeat = %last_heartbeat,
                        "worker alive but heartbeat is stale"
                    );
                    report.stale.push(job.id);
                }
                Liveness::Dead { reason, message } => {
                    match self
                        .ledger
                        .transition_if(
                            &job.id,
                            &JobStatus::ACTIVE,
                            JobStatus::Failed,
                            Some(message.clone()),
                        )
                        .await
                    {
                        Ok(true) => {
                            telemetry::record_reaped(&job.id, reason.as_str(), &message);
                            report.reaped.push(job.id);
                        }
                        Ok(false) => {
                            tracing::debug!(job_id = %job.id, "job left active statuses before reaping");
                            report.skipped += 1;
                        }
                        Err(err) => {
                            tracing::warn!(job_id = %job.id, error = %err, "failed to reap dead job");
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        if !report.reaped.is_empty() || !report.stale.is_empty() {
            tracing::info!(
                watched = report.watched,
                reaped = report.reaped.len(),
                stale = report.stale.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let interval = self.config.interval();
        tracing::info!(interval_secs = interval.as_secs(), "process supervisor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("process supervisor shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.sweep().await {
                        tracing::warn!(error = %err, "liveness sweep failed");
                    }
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobVersion;

    fn rules() -> LivenessRules {
        LivenessRules {
            heartbeat_stale: Duration::seconds(300),
            row_stale: Duration::seconds(600),
        }
    }

    fn job(updated_ago: Duration, now: DateTime<Utc>) -> JobRecord {
        let updated_at = now - updated_ago;
        JobRecord {
            id: JobId::parse("abc12345").unwrap(),
            status: JobStatus::Training,
            pipeline_mode: "train_only".into(),
            dataset_name: "faces".into(),
            preset: "default".into(),
            total_steps: Some(100),
            current_step: 10,
            start_time: Some(updated_at),
            end_time: None,
            duration_seconds: None,
            success: None,
            error_message: None,
            output_path: None,
            created_at: updated_at,
            updated_at: JobVersion(updated_at.timestamp_micros()).as_datetime(),
            variation: None,
        }
    }

    #[test]
    fn test_live_pid_with_fresh_heartbeat_is_alive() {
        let now = Utc::now();
        let markers = Markers {
            pid: Some(42),
            heartbeat: Some(now - Duration::seconds(10)),
        };
        let verdict = rules().classify(&job(Duration::zero(), now), &markers, Some(true), now);
        assert_eq!(verdict, Liveness::Alive);
    }

    #[test]
    fn test_live_pid_with_old_heartbeat_is_stale() {
        let now = Utc::now();
        let at = now - Duration::seconds(301);
        let markers = Markers {
            pid: Some(42),
            heartbeat: Some(at),
        };
        let verdict = rules().classify(&job(Duration::zero(), now), &markers, Some(true), now);
        assert_eq!(verdict, Liveness::Stale { last_heartbeat: at });
    }

    #[test]
    fn test_gone_pid_is_dead_unless_heartbeat_fresh() {
        let now = Utc::now();
        let record = job(Duration::zero(), now);

        let dead = rules().classify(&record, &Markers { pid: Some(4242), heartbeat: None }, Some(false), now);
        match dead {
            Liveness::Dead { reason, message } => {
                assert_eq!(reason, DeadReason::ProcessGone);
                assert_eq!(message, "process 4242 terminated unexpectedly");
            }
            other => panic!("expected dead, got {other:?}"),
        }

        let fresh = Markers {
            pid: Some(4242),
            heartbeat: Some(now - Duration::seconds(5)),
        };
        assert_eq!(rules().classify(&record, &fresh, Some(false), now), Liveness::Alive);
    }

    #[test]
    fn test_heartbeat_only() {
        let now = Utc::now();
        let record = job(Duration::zero(), now);

        let fresh = Markers {
            pid: None,
            heartbeat: Some(now - Duration::seconds(60)),
        };
        assert_eq!(rules().classify(&record, &fresh, None, now), Liveness::Alive);

        let stale = Markers {
            pid: None,
            heartbeat: Some(now - Duration::seconds(900)),
        };
        assert!(matches!(
            rules().classify(&record, &stale, None, now),
            Liveness::Dead { reason: DeadReason::HeartbeatStale, .. }
        ));
    }

    #[test]
    fn test_no_markers_uses_row_age() {
        let now = Utc::now();
        let none = Markers::default();

        let recent = job(Duration::seconds(599), now);
        assert_eq!(rules().classify(&recent, &none, None, now), Liveness::Alive);

        let old = job(Duration::seconds(601), now);
        assert!(matches!(
            rules().classify(&old, &none, None, now),
            Liveness::Dead { reason: DeadReason::NoMarkers, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        tokio::time::timeout(std::time::Duration::from_millis(100), clone.cancelled())
            .await
            .expect("already-cancelled token resolves immediately");
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }
}
