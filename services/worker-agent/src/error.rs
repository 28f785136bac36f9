//! Error types for the worker agent.

use std::path::PathBuf;
use std::time::Duration;

use fleet_control_plane::ControlPlaneError;
use thiserror::Error;

use crate::supervisor::pidfile::PidFileError;

/// Supervisor errors. Everything raised by `start` is fatal to startup.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker_dir_failed: {path}: {source}")]
    WorkerDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("log_open_failed: {path}: {source}")]
    LogOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("spawn_failed: {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("pid_file_failed: {0}")]
    PidFile(#[from] PidFileError),

    #[error("already_running: pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("signal_failed: {0}")]
    Signal(String),

    /// The supervision task has already finished.
    #[error("supervisor is not running")]
    NotRunning,
}

impl SupervisorError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SupervisorError::WorkerDir { .. } => "worker_dir_failed",
            SupervisorError::LogOpen { .. } => "log_open_failed",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::PidFile(_) => "pid_file_failed",
            SupervisorError::AlreadyRunning { .. } => "already_running",
            SupervisorError::Signal(_) => "signal_failed",
            SupervisorError::NotRunning => "not_running",
        }
    }
}

/// Package manager errors.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package manager not found at {0}")]
    ManagerMissing(PathBuf),

    #[error("failed to run package manager: {0}")]
    Io(#[from] std::io::Error),

    #[error("install of {spec} failed with {status}: {stderr}")]
    InstallFailed {
        spec: String,
        status: String,
        stderr: String,
    },

    #[error("package manager timed out after {0:?}")]
    Timeout(Duration),

    #[error("{step} failed with {status}: {stderr}")]
    StepFailed {
        step: &'static str,
        status: String,
        stderr: String,
    },
}

/// Errors raised while asking the worker to restart.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to signal process: {0}")]
    Signal(String),

    #[error("restart by signal is not supported on this platform")]
    Unsupported,
}

/// Update coordination errors. Lock conflicts are not errors, see
/// `UpdateOutcome::Deferred`.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("lock service unavailable: {0}")]
    LockUnavailable(#[source] ControlPlaneError),

    #[error("update cancelled by shutdown")]
    Cancelled,

    #[error("package trigger carries no target version")]
    MissingTargetVersion,

    #[error("refusing downgrade from {installed} to {target}")]
    DowngradeRefused { installed: String, target: String },

    #[error("package install failed: {0}")]
    PackageInstall(#[from] PackageError),

    #[error("restart failed: {0}")]
    Restart(#[from] RestartError),

    #[error("worker not healthy after {0:?}")]
    HealthTimeout(Duration),
}

impl CoordinatorError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            CoordinatorError::LockUnavailable(_) => "lock_unavailable",
            CoordinatorError::Cancelled => "cancelled",
            CoordinatorError::MissingTargetVersion => "missing_target_version",
            CoordinatorError::DowngradeRefused { .. } => "downgrade_refused",
            CoordinatorError::PackageInstall(_) => "package_install_failed",
            CoordinatorError::Restart(_) => "restart_failed",
            CoordinatorError::HealthTimeout(_) => "health_timeout",
        }
    }
}

/// Errors raised while detaching into the background.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    #[error("failed to locate current executable: {0}")]
    CurrentExe(std::io::Error),

    #[error("failed to spawn daemon: {0}")]
    Spawn(std::io::Error),

    #[error("daemon exited before becoming ready ({status}); see {log}")]
    ExitedEarly { status: String, log: PathBuf },

    #[error("daemon not ready after {0:?}")]
    Timeout(Duration),

    #[error("daemonizing is not supported on this platform")]
    Unsupported,
}
