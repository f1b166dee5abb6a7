//! Interrupt-driven drain of in-flight jobs.
//!
//! The signal listener only forwards interrupts on a channel. A dedicated
//! task runs [`ShutdownCoordinator::handle_interrupt`], which snapshots the
//! unfinished jobs, asks the operator for confirmation, and on a yes
//! terminates tracked children, cancels the jobs, stops auxiliary services
//! and deletes markers. A no, an error or a timeout leaves everything as it
//! was.

use std::fmt::{self, Write as _};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::ShutdownConfig;
use crate::job::{JobId, JobRecord};
use crate::store::Ledger;
use crate::telemetry;

use super::process::{terminate_group, ProcessRegistry, Termination, TrackedProcess};
use super::supervisor::ShutdownToken;

/// Asks the operator whether to drain.
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool>;
}

/// Prompts on stderr and reads a `y`/`yes` answer from stdin.
///
/// Stdin is read by one long-lived thread that forwards lines on a channel,
/// so a prompt that times out leaves no read behind to swallow the next
/// answer. Lines typed before a prompt is shown are discarded.
#[derive(Debug, Default)]
pub struct StdinConfirmation {
    lines: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl StdinConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read answers from `lines` instead of stdin.
    pub fn from_lines(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(Some(lines)),
        }
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("runledger-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "stdin read failed");
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to start stdin reader");
    }
    rx
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl Confirmation for StdinConfirmation {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        let mut guard = self.lines.lock().await;
        let lines = guard.get_or_insert_with(spawn_stdin_reader);
        while lines.try_recv().is_ok() {}

        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.write_all(b"Cancel all jobs and exit? [y/N] ").await?;
        stderr.flush().await?;

        match lines.recv().await {
            Some(answer) => Ok(is_yes(&answer)),
            None => anyhow::bail!("stdin closed"),
        }
    }
}

/// A helper service started alongside the jobs (for example an artifact
/// generator) that must be stopped on drain.
#[async_trait]
pub trait AuxiliaryService: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// What an interrupt found.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSnapshot {
    pub jobs: Vec<JobRecord>,
    pub current_job: Option<JobId>,
    pub processes: Vec<TrackedProcess>,
    /// The ledger could not be read, so `jobs` may be incomplete.
    pub ledger_unavailable: bool,
}

impl ShutdownSnapshot {
    /// True only when the ledger was read and nothing is running.
    pub fn is_empty(&self) -> bool {
        !self.ledger_unavailable
            && self.jobs.is_empty()
            && self.current_job.is_none()
            && self.processes.is_empty()
    }

    /// Ids of every job the drain touches.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.iter().map(|job| job.id.clone()).collect();
        ids.extend(self.current_job.iter().cloned());
        ids.extend(self.processes.iter().map(|p| p.job_id.clone()));
        ids.sort();
        ids.dedup();
        ids
    }

    /// Human-readable status shown before the confirmation prompt.
    pub fn render(&self) -> String {
        let mut out = String::from("\nInterrupt received.\n");
        if self.ledger_unavailable {
            out.push_str("Job ledger unavailable; unfinished jobs may not be listed.\n");
        }
        if let Some(current) = &self.current_job {
            let _ = writeln!(out, "Current job: {current}");
        }
        if !self.jobs.is_empty() {
            let _ = writeln!(out, "Unfinished jobs ({}):", self.jobs.len());
            for job in &self.jobs {
                let progress = job
                    .progress_pct()
                    .map(|pct| format!(" {pct:.0}%"))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {} {} [{}]{}",
                    job.id, job.status, job.dataset_name, progress
                );
            }
        }
        if !self.processes.is_empty() {
            let _ = writeln!(out, "Running processes ({}):", self.processes.len());
            for process in &self.processes {
                let _ = writeln!(out, "  pid {} (job {})", process.pid, process.job_id);
            }
        }
        out
    }
}

/// Result of a confirmed drain.
#[derive(Clone, Debug, Default)]
pub struct DrainReport {
    pub cancelled: u64,
    pub terminated: Vec<(JobId, Termination)>,
    pub services_stopped: Vec<String>,
    pub services_failed: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum ShutdownOutcome {
    /// Everything was cancelled; the process should exit.
    Drained(DrainReport),
    /// The operator declined or did not answer in time. Nothing changed.
    Resumed,
    /// Another interrupt is already being handled.
    InProgress,
}

impl ShutdownOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, ShutdownOutcome::Drained(_))
    }
}

/// Coordinates the interrupt drain.
pub struct ShutdownCoordinator {
    ledger: Arc<Ledger>,
    processes: Arc<ProcessRegistry>,
    config: ShutdownConfig,
    confirmation: Arc<dyn Confirmation>,
    services: Vec<Arc<dyn AuxiliaryService>>,
    current_job: Mutex<Option<JobId>>,
    in_progress: AtomicBool,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services: Vec<&str> = self.services.iter().map(|s| s.name()).collect();
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.config)
            .field("processes", &self.processes.len())
            .field("services", &services)
            .field("current_job", &*self.current_job.lock())
            .field("in_progress", &self.in_progress.load(Ordering::SeqCst))
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(
        ledger: Arc<Ledger>,
        processes: Arc<ProcessRegistry>,
        config: ShutdownConfig,
        confirmation: Arc<dyn Confirmation>,
    ) -> Self {
        Self {
            ledger,
            processes,
            config,
            confirmation,
            services: Vec::new(),
            current_job: Mutex::new(None),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn AuxiliaryService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    /// Record the job this process is working on, if any.
    pub fn set_current_job(&self, job: Option<JobId>) {
        *self.current_job.lock() = job;
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job.lock().clone()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Handle one interrupt. Concurrent calls return `InProgress`.
    pub async fn handle_interrupt(&self) -> ShutdownOutcome {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!("interrupt ignored; drain already in progress");
            return ShutdownOutcome::InProgress;
        }

        let snapshot = self.snapshot().await;
        let span = telemetry::shutdown_span(snapshot.job_ids().len(), snapshot.processes.len());
        let outcome = self.decide(snapshot).instrument(span).await;

        self.in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    /// Unfinished jobs from the ledger plus in-memory state.
    ///
    /// A ledger failure is logged and flagged on the snapshot, which then
    /// holds only what this process knows about.
    pub async fn snapshot(&self) -> ShutdownSnapshot {
        let (jobs, ledger_unavailable) = match self.ledger.unfinished_jobs().await {
            Ok(jobs) => (jobs, false),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list unfinished jobs");
                (Vec::new(), true)
            }
        };
        ShutdownSnapshot {
            jobs,
            current_job: self.current_job(),
            processes: self.processes.snapshot(),
            ledger_unavailable,
        }
    }

    async fn decide(&self, snapshot: ShutdownSnapshot) -> ShutdownOutcome {
        if snapshot.is_empty() {
            tracing::info!("interrupt with nothing running; exiting");
            return ShutdownOutcome::Drained(DrainReport::default());
        }

        let prompt = snapshot.render();
        let timeout = self.config.confirm_timeout();
        let confirmed =
            match tokio::time::timeout(timeout, self.confirmation.confirm(&prompt)).await {
                Ok(Ok(answer)) => answer,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "confirmation failed; resuming");
                    false
                }
                Err(_) => {
                    tracing::info!(timeout_secs = timeout.as_secs(), "no confirmation; resuming");
                    false
                }
            };

        if !confirmed {
            tracing::info!("drain declined; jobs continue");
            return ShutdownOutcome::Resumed;
        }
        ShutdownOutcome::Drained(self.drain(&snapshot).await)
    }

    /// Every step is best-effort: failures are logged and the drain goes on.
    async fn drain(&self, snapshot: &ShutdownSnapshot) -> DrainReport {
        let mut report = DrainReport::default();

        for process in &snapshot.processes {
            let outcome = terminate_group(process.pid, self.config.kill_grace()).await;
            tracing::info!(job_id = %process.job_id, pid = process.pid, ?outcome, "worker stopped");
            self.processes.unregister(&process.job_id);
            report.terminated.push((process.job_id.clone(), outcome));
        }

        match self.ledger.cancel_unfinished(&self.config.cancel_reason).await {
            Ok(count) => report.cancelled = count,
            Err(err) => tracing::warn!(error = %err, "failed to cancel unfinished jobs"),
        }

        for service in &self.services {
            match service.stop().await {
                Ok(()) => {
                    tracing::info!(service = service.name(), "auxiliary service stopped");
                    report.services_stopped.push(service.name().to_string());
                }
                Err(err) => {
                    tracing::warn!(service = service.name(), error = %err, "failed to stop auxiliary service");
                    report.services_failed.push(service.name().to_string());
                }
            }
        }

        for id in snapshot.job_ids() {
            self.ledger.markers().discard(&id).await;
        }
        self.set_current_job(None);

        tracing::info!(
            cancelled = report.cancelled,
            terminated = report.terminated.len(),
            "drain complete"
        );
        report
    }

    /// Forward interrupts from the OS to a dedicated drain task.
    ///
    /// The returned handle finishes after a drain, at which point `shutdown`
    /// has been cancelled.
    pub fn spawn_listener(self: Arc<Self>, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let (tx, rx) = mpsc::channel(1);

        let signals = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = signals.cancelled() => break,
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            tracing::error!(error = %err, "failed to listen for interrupts");
                            break;
                        }
                        if tx.try_send(()).is_err() {
                            tracing::debug!("interrupt already pending");
                        }
                    }
                }
            }
        });

        tokio::spawn(async move { self.drain_on_interrupt(rx, shutdown).await })
    }

    /// Handle interrupts from `interrupts` until one drains.
    pub async fn drain_on_interrupt(
        &self,
        mut interrupts: mpsc::Receiver<()>,
        shutdown: ShutdownToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = interrupts.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if self.handle_interrupt().await.is_drained() {
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
    }
}
