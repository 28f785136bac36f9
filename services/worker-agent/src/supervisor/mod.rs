//! Process supervisor for the local worker.
//!
//! Launches the worker in its own process group, pipes its output into a
//! rotating log and restarts it with exponential backoff when it exits
//! unexpectedly:
//!
//! ```text
//! Starting -> Running -> (CrashDetected -> Backoff -> Restarting -> Running)*
//!          -> Stopped | Failed
//! ```
//!
//! The handle talks to a background supervision task through a command
//! channel; state changes are published on a `watch` channel.

pub mod backoff;
pub mod logfile;
pub mod pidfile;
pub mod process;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_id::QueueId;
use fleet_model::{DaemonInfo, DeploymentType};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::SupervisorError;

pub use backoff::{BackoffPolicy, RestartDecision, RestartPolicy, RestartTracker};
pub use logfile::{RotatingLog, SharedLog};
pub use pidfile::{PidFile, PidFileError, LOG_FILE_NAME, PID_FILE_NAME};
pub use process::StopSignal;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Size at which the active log file is rotated.
    pub max_log_size: u64,

    /// Rotated log files to keep.
    pub max_log_backups: usize,

    pub restart: RestartPolicy,

    /// Time between SIGTERM and SIGKILL when stopping the process group.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_log_size: 100 * 1024 * 1024,
            max_log_backups: 5,
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub queue_id: QueueId,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub worker_dir: PathBuf,
    pub deployment_type: DeploymentType,
}

impl LaunchSpec {
    pub fn new(queue_id: QueueId, program: impl Into<String>, worker_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_id,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            worker_dir: worker_dir.into(),
            deployment_type: DeploymentType::Foreground,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.worker_dir.join(LOG_FILE_NAME)
    }
}

// =============================================================================
// States
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running { pid: u32 },
    /// The worker exited on its own; `exit_code` is `None` when it was
    /// killed by a signal.
    CrashDetected { exit_code: Option<i32> },
    Backoff { attempt: u32, delay: Duration },
    Restarting { attempt: u32 },
    Stopped,
    Failed { attempts: u32 },
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed { .. })
    }
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Stopped on request.
    Stopped,
    /// Gave up after too many crashes.
    Failed { attempts: u32 },
}

enum SupervisorCommand {
    Stop {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<u32, SupervisorError>>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a supervised worker. Dropping it stops the worker.
#[derive(Debug)]
pub struct ProcessSupervisor {
    info: DaemonInfo,
    log: SharedLog,
    stop_grace: Duration,
    commands: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<SupervisorState>,
    restarts: Arc<AtomicU32>,
}

impl std::fmt::Debug for SupervisorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorCommand::Stop { grace, .. } => write!(f, "Stop({grace:?})"),
            SupervisorCommand::Restart { .. } => write!(f, "Restart"),
        }
    }
}

impl ProcessSupervisor {
    /// Starts the worker, logging into `<worker_dir>/worker.log`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SupervisorConfig, spec: LaunchSpec) -> Result<Self, SupervisorError> {
        create_worker_dir(&spec)?;
        let path = spec.log_path();
        let log = SharedLog::open(&path, config.max_log_size, config.max_log_backups)
            .map_err(|source| SupervisorError::LogOpen { path, source })?;
        Self::start_with_log(config, spec, log)
    }

    /// Starts the worker with an already opened log.
    pub fn start_with_log(
        config: SupervisorConfig,
        spec: LaunchSpec,
        log: SharedLog,
    ) -> Result<Self, SupervisorError> {
        create_worker_dir(&spec)?;

        let pid_file = PidFile::in_dir(&spec.worker_dir);
        check_not_running(&pid_file, &log)?;

        let info = DaemonInfo {
            pid: std::process::id(),
            worker_pgid: None,
            queue_id: spec.queue_id.clone(),
            worker_dir: spec.worker_dir.clone(),
            log_file: log.path(),
            pid_file: pid_file.path().to_path_buf(),
            started_at: Utc::now(),
            deployment_type: spec.deployment_type,
        };

        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let mut supervision = Supervision {
            tracker: RestartTracker::new(config.restart.clone()),
            config,
            spec,
            log: log.clone(),
            pid_file,
            info,
            state: state_tx,
            restarts: Arc::new(AtomicU32::new(0)),
        };

        let mut child = supervision.spawn()?;

        if let Err(e) = supervision.record_worker(child.id()) {
            if let Some(pid) = child.id() {
                let _ = process::signal_group(pid, StopSignal::Kill);
            }
            let _ = child.start_kill();
            log.supervisor_line(&format!("Failed to write PID file: {e}"));
            return Err(e.into());
        }

        let (tx, rx) = mpsc::channel(8);
        let handle = Self {
            info: supervision.info.clone(),
            log,
            stop_grace: supervision.config.stop_grace,
            commands: tx,
            state: state_rx,
            restarts: supervision.restarts.clone(),
        };
        tokio::spawn(supervision.run(child, rx));

        Ok(handle)
    }

    /// The record written to the PID file at start. `worker_pgid` names the
    /// first worker child; the file itself tracks later restarts.
    pub fn info(&self) -> &DaemonInfo {
        &self.info
    }

    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Pid of the current worker process, if one is running.
    pub fn child_pid(&self) -> Option<u32> {
        match *self.state.borrow() {
            SupervisorState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    /// Crash restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Stops the process group: SIGTERM, then SIGKILL after the configured
    /// grace period.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.stop_within(self.stop_grace).await
    }

    /// Stops the process group with SIGKILL. Also cuts short a graceful stop
    /// that is already waiting out its grace period.
    pub async fn force_stop(&self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.child_pid() {
            if let Err(e) = process::signal_group(pid, StopSignal::Kill) {
                warn!(pid, error = %e, "Failed to kill worker process group");
            }
        }
        self.stop_within(Duration::ZERO).await
    }

    async fn stop_within(&self, grace: Duration) -> Result<(), SupervisorError> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(SupervisorCommand::Stop { grace, reply })
            .await
            .is_err()
        {
            // Supervision already ended.
            return Ok(());
        }
        let _ = done.await;
        self.wait().await;
        Ok(())
    }

    /// Gracefully stops the worker and starts a fresh one. Not counted as a
    /// crash. Returns the new worker pid.
    pub async fn restart(&self) -> Result<u32, SupervisorError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::Restart { reply })
            .await
            .map_err(|_| SupervisorError::NotRunning)?;
        done.await.map_err(|_| SupervisorError::NotRunning)?
    }

    /// Resolves when supervision has ended.
    pub async fn wait(&self) -> SupervisorOutcome {
        let mut state = self.state.clone();
        let terminal = state.wait_for(SupervisorState::is_terminal).await.map(|s| s.clone());
        match terminal {
            Ok(SupervisorState::Failed { attempts }) => SupervisorOutcome::Failed { attempts },
            Ok(_) => SupervisorOutcome::Stopped,
            // The task went away without a verdict.
            Err(_) => SupervisorOutcome::Failed {
                attempts: self.restarts(),
            },
        }
    }
}

fn create_worker_dir(spec: &LaunchSpec) -> Result<(), SupervisorError> {
    std::fs::create_dir_all(&spec.worker_dir).map_err(|source| SupervisorError::WorkerDir {
        path: spec.worker_dir.clone(),
        source,
    })
}

/// Refuses to start over a live supervisor; clears a stale PID file.
fn check_not_running(pid_file: &PidFile, log: &SharedLog) -> Result<(), SupervisorError> {
    let existing = match pid_file.read() {
        Ok(existing) => existing,
        Err(PidFileError::Corrupt { .. }) => {
            warn!(path = %pid_file.path().display(), "Removing corrupt PID file");
            pid_file.remove()?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(info) = existing {
        if info.pid != std::process::id() && process::is_alive(info.pid) {
            return Err(SupervisorError::AlreadyRunning { pid: info.pid });
        }
        info!(pid = info.pid, "Removing stale PID file");
        log.supervisor_line(&format!("Removing stale PID file (pid {})", info.pid));
        pid_file.remove()?;
    }
    Ok(())
}

// =============================================================================
// Supervision task
// =============================================================================

struct Supervision {
    config: SupervisorConfig,
    spec: LaunchSpec,
    log: SharedLog,
    pid_file: PidFile,
    info: DaemonInfo,
    state: watch::Sender<SupervisorState>,
    tracker: RestartTracker,
    restarts: Arc<AtomicU32>,
}

impl Supervision {
    async fn run(mut self, mut child: Child, mut commands: mpsc::Receiver<SupervisorCommand>) {
        let mut started = Instant::now();

        loop {
            let pid = child.id().unwrap_or_default();
            if self.info.worker_pgid != child.id() {
                if let Err(e) = self.record_worker(child.id()) {
                    warn!(pid, error = %e, "Failed to record worker process group");
                }
            }
            self.set_state(SupervisorState::Running { pid });

            tokio::select! {
                status = child.wait() => {
                    self.report_exit(pid, status);
                    match self.restart_after_crash(started.elapsed(), &mut commands).await {
                        Some(next) => {
                            child = next;
                            started = Instant::now();
                        }
                        None => return,
                    }
                }
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Restart { reply }) => {
                        self.log.supervisor_line("Restart requested");
                        self.stop_child(&mut child, self.config.stop_grace).await;
                        match self.spawn() {
                            Ok(next) => {
                                let _ = reply.send(Ok(next.id().unwrap_or_default()));
                                child = next;
                                started = Instant::now();
                            }
                            Err(e) => {
                                error!(queue_id = %self.spec.queue_id, error = %e, "Failed to start worker after restart");
                                let _ = reply.send(Err(e));
                                match self.restart_after_crash(Duration::ZERO, &mut commands).await {
                                    Some(next) => {
                                        child = next;
                                        started = Instant::now();
                                    }
                                    None => return,
                                }
                            }
                        }
                    }
                    Some(SupervisorCommand::Stop { grace, reply }) => {
                        self.stop_child(&mut child, grace).await;
                        self.finish(SupervisorOutcome::Stopped);
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.stop_child(&mut child, self.config.stop_grace).await;
                        self.finish(SupervisorOutcome::Stopped);
                        return;
                    }
                },
            }
        }
    }

    /// Backs off and respawns until a child is running, supervision is
    /// stopped, or the restart budget is spent.
    async fn restart_after_crash(
        &mut self,
        uptime: Duration,
        commands: &mut mpsc::Receiver<SupervisorCommand>,
    ) -> Option<Child> {
        let mut uptime = uptime;
        loop {
            let (attempt, delay) = match self.tracker.on_exit(uptime) {
                RestartDecision::GiveUp { attempts } => {
                    self.finish(SupervisorOutcome::Failed { attempts });
                    return None;
                }
                RestartDecision::Restart { attempt, delay } => (attempt, delay),
            };

            self.set_state(SupervisorState::Backoff { attempt, delay });
            info!(
                queue_id = %self.spec.queue_id,
                attempt,
                max_attempts = self.tracker.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Restarting worker after backoff"
            );
            self.log.supervisor_line(&format!(
                "Restarting in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.tracker.max_attempts()
            ));

            let mut pending_reply = None;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Stop { reply, .. }) => {
                        self.finish(SupervisorOutcome::Stopped);
                        let _ = reply.send(());
                        return None;
                    }
                    None => {
                        self.finish(SupervisorOutcome::Stopped);
                        return None;
                    }
                    Some(SupervisorCommand::Restart { reply }) => pending_reply = Some(reply),
                },
            }

            self.set_state(SupervisorState::Restarting { attempt });
            self.restarts.fetch_add(1, Ordering::Relaxed);

            match self.spawn() {
                Ok(child) => {
                    if let Some(reply) = pending_reply {
                        let _ = reply.send(Ok(child.id().unwrap_or_default()));
                    }
                    return Some(child);
                }
                Err(e) => {
                    error!(queue_id = %self.spec.queue_id, attempt, error = %e, "Failed to restart worker");
                    self.log
                        .supervisor_line(&format!("Failed to restart worker: {e}"));
                    if let Some(reply) = pending_reply {
                        let _ = reply.send(Err(e));
                    }
                    uptime = Duration::ZERO;
                }
            }
        }
    }

    /// Rewrites the PID file with the group of the current worker child,
    /// `None` once that child has already been reaped.
    fn record_worker(&mut self, pgid: Option<u32>) -> Result<(), PidFileError> {
        self.info.worker_pgid = pgid;
        self.pid_file.write(&self.info)
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .current_dir(&self.spec.worker_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so stop signals reach the worker's children too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, self.log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, self.log.clone()));
        }

        let pid = child.id().unwrap_or_default();
        info!(queue_id = %self.spec.queue_id, pid, program = %self.spec.program, "Worker started");
        self.log
            .supervisor_line(&format!("Worker started (pid {pid})"));
        Ok(child)
    }

    /// SIGTERM to the group, SIGKILL once `grace` has passed.
    async fn stop_child(&self, child: &mut Child, grace: Duration) {
        let Some(pid) = child.id() else {
            return;
        };
        self.log.supervisor_line(&format!(
            "Stopping worker (pid {pid}, grace {grace:?})"
        ));

        if !grace.is_zero() {
            if let Err(e) = process::signal_group(pid, StopSignal::Terminate) {
                warn!(pid, error = %e, "Failed to signal worker process group");
                let _ = child.start_kill();
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                info!(queue_id = %self.spec.queue_id, pid, status = %describe(status), "Worker stopped");
                return;
            }
            warn!(queue_id = %self.spec.queue_id, pid, grace_secs = grace.as_secs(), "Worker ignored SIGTERM, killing process group");
            self.log
                .supervisor_line(&format!("Grace period elapsed, killing pid {pid}"));
        }

        if let Err(e) = process::signal_group(pid, StopSignal::Kill) {
            warn!(pid, error = %e, "Failed to kill worker process group");
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    fn report_exit(&self, pid: u32, status: std::io::Result<ExitStatus>) {
        let exit_code = status.as_ref().ok().and_then(ExitStatus::code);
        let description = describe(status);
        warn!(queue_id = %self.spec.queue_id, pid, status = %description, "Worker exited unexpectedly");
        self.log
            .supervisor_line(&format!("Worker exited unexpectedly (pid {pid}, {description})"));
        self.set_state(SupervisorState::CrashDetected { exit_code });
    }

    fn finish(&self, outcome: SupervisorOutcome) {
        match outcome {
            SupervisorOutcome::Stopped => {
                if let Err(e) = self.pid_file.remove() {
                    warn!(error = %e, "Failed to remove PID file");
                }
                info!(queue_id = %self.spec.queue_id, "Supervisor stopped");
                self.log.supervisor_line("Supervisor stopped");
                self.set_state(SupervisorState::Stopped);
            }
            SupervisorOutcome::Failed { attempts } => {
                error!(
                    queue_id = %self.spec.queue_id,
                    attempts,
                    worker_dir = %self.spec.worker_dir.display(),
                    "Worker keeps crashing, giving up"
                );
                self.log.supervisor_line(&format!(
                    "Giving up after {attempts} restart attempts; PID file and logs kept in {}",
                    self.spec.worker_dir.display()
                ));
                self.set_state(SupervisorState::Failed { attempts });
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}

fn describe(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

/// Copies one output stream of the worker into the log.
async fn pump(mut reader: impl AsyncRead + Unpin, mut log: SharedLog) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = log.write_all(&buf[..n]) {
                    warn!(error = %e, "Failed to write worker output to log");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read worker output");
                break;
            }
        }
    }
    let _ = log.flush();
}
