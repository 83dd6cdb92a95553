//! Process supervision with crash-restart and bounded backoff
//!
//! A [`Supervisor`] owns one child process for the lifetime of a
//! component: it spawns the configured binary, watches for exit, and
//! restarts it with exponential backoff. Restarts are counted in a
//! sliding window; when the window fills, supervision gives up and
//! reports [`SupervisorStatus::Exhausted`] exactly once. An intentional
//! stop never counts as a crash.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::Rng;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::Result;

/// Initial delay before the first restart
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);

/// Ceiling on the restart delay
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Multiplier applied to the delay after each consecutive crash
const BACKOFF_MULTIPLIER: u32 = 2;

/// Restarts allowed within [`RESTART_WINDOW`] before giving up
const MAX_RESTARTS: u32 = 5;

/// Sliding window over which restarts are counted
const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// How long a stopped process gets to exit after SIGTERM before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Specification of a supervised process
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    /// Name used in logs and status reporting
    pub name: String,
    /// Path to the binary
    pub binary: PathBuf,
    /// Arguments, not including the binary itself
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Run as this uid when set (requires root)
    pub uid: Option<u32>,
    /// Run under this gid when set
    pub gid: Option<u32>,
    /// Working directory for the child
    pub work_dir: Option<PathBuf>,
    /// File receiving the child's stdout and stderr
    pub log_path: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            uid: None,
            gid: None,
            work_dir: None,
            log_path: None,
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn uid(mut self, uid: Option<u32>) -> Self {
        self.uid = uid;
        self
    }

    pub fn gid(mut self, gid: Option<u32>) -> Self {
        self.gid = gid;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

/// Observable state of a supervised process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// Child is alive with this pid
    Running { pid: u32 },
    /// Child exited and a restart is pending
    Restarting { restarts: u32 },
    /// Supervision was stopped intentionally
    Stopped,
    /// Restart budget spent; supervision has given up
    Exhausted { restarts: u32 },
}

/// Sliding-window restart accounting with exponential backoff
///
/// Tracks crash timestamps; `record_crash` returns the delay to wait
/// before the next spawn, or None when the window is full.
struct RestartTracker {
    crashes: VecDeque<Instant>,
    delay: Duration,
}

impl RestartTracker {
    fn new() -> Self {
        Self {
            crashes: VecDeque::new(),
            delay: BACKOFF_INITIAL,
        }
    }

    fn record_crash(&mut self, now: Instant) -> Option<Duration> {
        while let Some(front) = self.crashes.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.crashes.pop_front();
            } else {
                break;
            }
        }

        if self.crashes.len() as u32 >= MAX_RESTARTS {
            return None;
        }
        self.crashes.push_back(now);

        let delay = self.delay;
        self.delay = (self.delay * BACKOFF_MULTIPLIER).min(BACKOFF_CAP);
        Some(delay)
    }

    /// A healthy run resets the backoff curve, not the window
    fn reset_backoff(&mut self) {
        self.delay = BACKOFF_INITIAL;
    }

    fn restarts(&self) -> u32 {
        self.crashes.len() as u32
    }
}

/// Supervises a single child process
pub struct Supervisor {
    spec: ProcessSpec,
    stopping: Arc<AtomicBool>,
    pid: Arc<Mutex<Option<u32>>>,
    status_tx: watch::Sender<SupervisorStatus>,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(spec: ProcessSpec) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::Stopped);
        Self {
            spec,
            stopping: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(Mutex::new(None)),
            status_tx,
            monitor: Mutex::new(None),
        }
    }

    /// Subscribe to status transitions
    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Spawn the process and begin supervising it
    ///
    /// Returns once the first spawn succeeds; the monitor task then owns
    /// the restart loop until `stop` or exhaustion.
    pub async fn start(&self) -> Result<()> {
        self.stopping.store(false, Ordering::SeqCst);

        let mut child = spawn_child(&self.spec).await?;
        let pid = child.id().ok_or_else(|| {
            Error::invalid_state(format!("{} exited before supervision began", self.spec.name))
        })?;
        info!(process = %self.spec.name, pid = pid, "process started");
        *self.pid.lock().await = Some(pid);
        let _ = self.status_tx.send(SupervisorStatus::Running { pid });

        let spec = self.spec.clone();
        let stopping = self.stopping.clone();
        let pid_slot = self.pid.clone();
        let status_tx = self.status_tx.clone();

        let handle = tokio::spawn(async move {
            let mut tracker = RestartTracker::new();
            loop {
                let started_at = Instant::now();
                let exit = child.wait().await;
                *pid_slot.lock().await = None;

                // Ordering matters: the stop path sets the flag before
                // signalling, so an exit caused by our own SIGTERM is
                // never treated as a crash.
                if stopping.load(Ordering::SeqCst) {
                    debug!(process = %spec.name, "exited after intentional stop");
                    let _ = status_tx.send(SupervisorStatus::Stopped);
                    return;
                }

                match &exit {
                    Ok(status) => {
                        warn!(process = %spec.name, exit = %status, "process exited unexpectedly")
                    }
                    Err(e) => error!(process = %spec.name, error = %e, "failed to reap process"),
                }

                if started_at.elapsed() > RESTART_WINDOW {
                    tracker.reset_backoff();
                }

                let delay = match tracker.record_crash(Instant::now()) {
                    Some(d) => d,
                    None => {
                        let restarts = tracker.restarts();
                        error!(
                            process = %spec.name,
                            restarts = restarts,
                            "restart budget exhausted, giving up"
                        );
                        let _ = status_tx
                            .send(SupervisorStatus::Exhausted { restarts });
                        return;
                    }
                };

                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                let delay = delay + Duration::from_millis(jitter);
                let _ = status_tx.send(SupervisorStatus::Restarting {
                    restarts: tracker.restarts(),
                });
                info!(
                    process = %spec.name,
                    delay_ms = delay.as_millis() as u64,
                    "restarting after backoff"
                );
                tokio::time::sleep(delay).await;

                if stopping.load(Ordering::SeqCst) {
                    let _ = status_tx.send(SupervisorStatus::Stopped);
                    return;
                }

                child = match spawn_child(&spec).await {
                    Ok(c) => c,
                    Err(e) => {
                        error!(process = %spec.name, error = %e, "respawn failed");
                        continue;
                    }
                };
                if let Some(pid) = child.id() {
                    *pid_slot.lock().await = Some(pid);
                    let _ = status_tx.send(SupervisorStatus::Running { pid });
                }
            }
        });
        *self.monitor.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the process intentionally: SIGTERM, grace period, SIGKILL
    ///
    /// Safe to call when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let pid = { *self.pid.lock().await };
        if let Some(pid) = pid {
            info!(process = %self.spec.name, pid = pid, "terminating process");
            let target = Pid::from_raw(pid as i32);
            if let Err(e) = kill(target, Signal::SIGTERM) {
                // ESRCH means the process beat us to exiting on its own.
                debug!(process = %self.spec.name, error = %e, "SIGTERM delivery failed");
            }

            let deadline = Instant::now() + TERMINATE_GRACE;
            while Instant::now() < deadline {
                if self.pid.lock().await.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if self.pid.lock().await.is_some() {
                warn!(process = %self.spec.name, pid = pid, "grace period expired, sending SIGKILL");
                let _ = kill(target, Signal::SIGKILL);
            }
        }

        if let Some(handle) = self.monitor.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.status_tx.send(SupervisorStatus::Stopped);
        Ok(())
    }
}

async fn spawn_child(spec: &ProcessSpec) -> Result<tokio::process::Child> {
    let mut cmd = Command::new(&spec.binary);
    cmd.args(&spec.args);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(dir) = &spec.work_dir {
        cmd.current_dir(dir);
    }
    if let Some(uid) = spec.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = spec.gid {
        cmd.gid(gid);
    }

    match &spec.log_path {
        Some(path) => {
            let log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            cmd.stdout(Stdio::from(log.try_clone()?));
            cmd.stderr(Stdio::from(log));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| Error::config(format!("failed to spawn {}: {}", spec.binary.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Restart Accounting
    // ==========================================================================

    /// Story: A process that keeps crashing gets exactly the budgeted number
    /// of restarts, then supervision gives up
    #[test]
    fn story_restart_budget_is_exact() {
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        for i in 0..MAX_RESTARTS {
            assert!(
                tracker.record_crash(now).is_some(),
                "restart {} should be granted",
                i + 1
            );
        }
        assert!(tracker.record_crash(now).is_none(), "budget must be spent");
        assert_eq!(tracker.restarts(), MAX_RESTARTS);
    }

    /// Story: Backoff doubles, then hits the ceiling
    #[test]
    fn story_backoff_doubles_to_a_cap() {
        let mut tracker = RestartTracker::new();
        let mut now = Instant::now();
        let mut seen = Vec::new();

        // Spread crashes out so the window never fills.
        for _ in 0..8 {
            if let Some(d) = tracker.record_crash(now) {
                seen.push(d);
            }
            tracker.crashes.clear();
            now += Duration::from_secs(1);
        }

        assert_eq!(seen[0], BACKOFF_INITIAL);
        assert_eq!(seen[1], BACKOFF_INITIAL * 2);
        assert_eq!(seen[2], BACKOFF_INITIAL * 4);
        assert_eq!(*seen.last().unwrap(), BACKOFF_CAP);
    }

    /// Story: Crashes age out of the sliding window
    ///
    /// Five crashes an hour ago say nothing about the process now; the
    /// window forgets them and the next crash is granted a restart.
    #[test]
    fn story_old_crashes_age_out() {
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        for _ in 0..MAX_RESTARTS {
            tracker.record_crash(start).unwrap();
        }
        assert!(tracker.record_crash(start).is_none());

        let later = start + RESTART_WINDOW + Duration::from_secs(1);
        assert!(
            tracker.record_crash(later).is_some(),
            "expired crashes must not count against the budget"
        );
    }

    /// Story: A long healthy run resets the backoff curve
    #[test]
    fn story_healthy_run_resets_backoff() {
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        assert_eq!(tracker.record_crash(now), Some(BACKOFF_INITIAL));
        assert_eq!(tracker.record_crash(now), Some(BACKOFF_INITIAL * 2));

        tracker.reset_backoff();
        assert_eq!(tracker.record_crash(now), Some(BACKOFF_INITIAL));
    }

    // ==========================================================================
    // Story Tests: Supervising Real Processes
    // ==========================================================================

    /// Story: A short-lived process is restarted, and exhaustion is
    /// reported exactly once
    #[tokio::test]
    async fn story_crashing_process_exhausts_once() {
        // `true` exits immediately with status 0, which still counts as an
        // unexpected exit since nothing asked it to stop.
        let spec = ProcessSpec::new("flaky", "/bin/true");
        let supervisor = Supervisor::new(spec);
        let mut status = supervisor.status();

        supervisor.start().await.unwrap();

        let mut exhausted = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let SupervisorStatus::Exhausted { restarts } = &*status.borrow() {
                        assert_eq!(*restarts, MAX_RESTARTS);
                        exhausted += 1;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
            if exhausted > 0 {
                // Linger briefly to catch any duplicate report.
                tokio::time::sleep(Duration::from_millis(200)).await;
                break;
            }
        }
        assert_eq!(exhausted, 1, "exhaustion must be reported exactly once");
    }

    /// Story: An intentional stop is never mistaken for a crash
    ///
    /// The stop flag is raised before the signal goes out, so when the
    /// monitor sees the exit it knows it was asked for.
    #[tokio::test]
    async fn story_intentional_stop_is_not_a_crash() {
        let spec = ProcessSpec::new("sleeper", "/bin/sleep").args(vec!["300".to_string()]);
        let supervisor = Supervisor::new(spec);
        let mut status = supervisor.status();

        supervisor.start().await.unwrap();
        assert!(matches!(
            &*status.borrow_and_update(),
            SupervisorStatus::Running { .. }
        ));

        supervisor.stop().await.unwrap();
        assert_eq!(*status.borrow(), SupervisorStatus::Stopped);
    }

    /// Story: Stop with nothing running is a no-op
    #[tokio::test]
    async fn story_stop_without_start_is_harmless() {
        let supervisor = Supervisor::new(ProcessSpec::new("idle", "/bin/true"));
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
    }
}
