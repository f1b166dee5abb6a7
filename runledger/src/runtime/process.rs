//! OS process probing and process-group termination.

use std::collections::HashMap;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::job::JobId;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Liveness probe for a PID.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)` and `/proc/<pid>/stat`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        pid_exists(pid)
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// True if `pid` names a running, non-zombie process.
///
/// A process owned by another user (EPERM) counts as running.
pub fn pid_exists(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    let exists = match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            tracing::debug!(pid, error = %err, "unexpected errno probing pid");
            false
        }
    };
    exists && !is_zombie(pid)
}

/// Reads the state field of `/proc/<pid>/stat`. Always false off Linux.
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat_fields(&stat).is_some_and(|(state, _)| is_dead_state(state))
}

/// State and process group from a `/proc/<pid>/stat` line.
fn stat_fields(stat: &str) -> Option<(&str, i32)> {
    // The command name may contain spaces or parens; the state follows the
    // last closing paren, then ppid, then pgrp.
    let idx = stat.rfind(')')?;
    let mut fields = stat[idx + 1..].split_whitespace();
    let state = fields.next()?;
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}

fn is_dead_state(state: &str) -> bool {
    state == "Z" || state == "X"
}

/// True while any non-zombie process remains in group `pgid`.
///
/// `killpg(pgid, 0)` keeps succeeding while unreaped zombies hold the group,
/// so `/proc` is consulted where it exists.
pub fn group_alive(pgid: u32) -> bool {
    let Some(target) = to_pid(pgid) else {
        return false;
    };
    match killpg(target, None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries.flatten().any(|entry| {
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            return false;
        }
        std::fs::read_to_string(entry.path().join("stat"))
            .ok()
            .as_deref()
            .and_then(stat_fields)
            .is_some_and(|(state, pgrp)| pgrp == target.as_raw() && !is_dead_state(state))
    })
}

/// How a termination request ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Nothing was running.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Still running after the grace period; SIGKILL sent.
    Killed,
}

const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Send SIGTERM to the process group led by `pid`, then SIGKILL to the whole
/// group if any member outlives `grace`.
///
/// Falls back to signalling the process alone when it does not lead a group.
pub async fn terminate_group(pid: u32, grace: Duration) -> Termination {
    if to_pid(pid).is_none() {
        return Termination::AlreadyExited;
    }
    let group = group_alive(pid);
    if !group && !pid_exists(pid) {
        return Termination::AlreadyExited;
    }
    let running = move || if group { group_alive(pid) } else { pid_exists(pid) };

    let signalled_group = send(pid, Signal::SIGTERM);
    tracing::info!(pid, group = signalled_group, "sent SIGTERM");

    if wait_until_gone(&running, grace).await {
        return Termination::Terminated;
    }

    send(pid, Signal::SIGKILL);
    tracing::warn!(pid, grace_secs = grace.as_secs(), "process group ignored SIGTERM; sent SIGKILL");
    if !wait_until_gone(&running, KILL_SETTLE).await {
        tracing::error!(pid, "process group still running after SIGKILL");
    }
    Termination::Killed
}

/// Poll `running` until it reports false or `limit` passes.
async fn wait_until_gone(running: &impl Fn() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !running() {
            return true;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    !running()
}

/// Signal the group, or the single process if there is no such group.
/// Returns true when the group was signalled.
fn send(pid: u32, signal: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match killpg(target, signal) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(pid = %target, %signal, error = %err, "killpg failed; signalling pid");
            if let Err(err) = kill(target, signal) {
                tracing::debug!(pid = %target, %signal, error = %err, "kill failed");
            }
            false
        }
    }
}

/// A child process started by this process on behalf of a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackedProcess {
    pub job_id: JobId,
    pub pid: u32,
}

/// Children to terminate on shutdown, keyed by job.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<JobId, u32>>,
}

impl ProcessRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid` for `job_id`, replacing any earlier pid for the job.
    pub fn register(&self, job_id: JobId, pid: u32) {
        self.inner.lock().insert(job_id, pid);
    }

    /// Stop tracking `job_id`, returning its pid if it was tracked.
    pub fn unregister(&self, job_id: &JobId) -> Option<u32> {
        self.inner.lock().remove(job_id)
    }

    /// Number of tracked children.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no child is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Tracked children ordered by job id.
    pub fn snapshot(&self) -> Vec<TrackedProcess> {
        let mut tracked: Vec<TrackedProcess> = self
            .inner
            .lock()
            .iter()
            .map(|(job_id, pid)| TrackedProcess {
                job_id: job_id.clone(),
                pid: *pid,
            })
            .collect();
        tracked.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
        tracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_exists(std::process::id()));
        assert!(OsProbe.is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!pid_exists(0));
        assert!(!pid_exists(u32::MAX));
    }

    #[test]
    fn test_reaped_child_is_gone() {
        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!pid_exists(pid));
    }

    #[test]
    fn test_unreaped_child_counts_as_dead() {
        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        // Give it time to exit without reaping it.
        std::thread::sleep(Duration::from_millis(300));
        assert!(!pid_exists(pid), "zombie should not be reported alive");
        child.wait().expect("wait");
    }

    #[tokio::test]
    async fn test_terminate_group_stops_sleeping_child() {
        use std::os::unix::process::CommandExt;

        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn");
        let pid = child.id();

        let reaper = std::thread::spawn(move || child.wait());
        let outcome = terminate_group(pid, Duration::from_secs(5)).await;
        assert_eq!(outcome, Termination::Terminated);
        reaper.join().expect("join").expect("wait");
    }

    #[tokio::test]
    async fn test_terminate_group_kills_member_ignoring_sigterm() {
        use std::os::unix::process::CommandExt;

        // The shell exits on SIGTERM; its background sleep ignores it.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30 & trap - TERM; wait")
            .process_group(0)
            .spawn()
            .expect("spawn");
        let pgid = child.id();
        let reaper = std::thread::spawn(move || child.wait());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let outcome = terminate_group(pgid, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::Killed);
        assert!(!group_alive(pgid), "no group member may survive");
        reaper.join().expect("join").expect("wait");
    }

    #[test]
    fn test_stat_fields_handles_parens_in_name() {
        let stat = "4242 (odd) name)) S 1 4240 4240 0 -1";
        assert_eq!(stat_fields(stat), Some(("S", 4240)));
        assert_eq!(stat_fields("garbage"), None);
    }

    #[tokio::test]
    async fn test_terminate_missing_process() {
        assert_eq!(
            terminate_group(0, Duration::from_millis(10)).await,
            Termination::AlreadyExited
        );
    }

    #[test]
    fn test_registry_snapshot_is_sorted() {
        let registry = ProcessRegistry::new();
        registry.register(JobId::parse("job-b").unwrap(), 20);
        registry.register(JobId::parse("job-a").unwrap(), 10);
        registry.register(JobId::parse("job-b").unwrap(), 21);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].job_id.as_str(), "job-a");
        assert_eq!(snapshot[1].pid, 21);

        assert_eq!(registry.unregister(&JobId::parse("job-a").unwrap()), Some(10));
        assert_eq!(registry.len(), 1);
    }
}
