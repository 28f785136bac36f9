//! Detaching the worker agent into the background.
//!
//! The parent re-executes the current binary with [`DAEMON_CHILD_ENV`] set
//! and waits until the child has written a PID file naming itself. The child
//! then runs the normal supervisor, logging into the worker's rotating log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_model::DaemonInfo;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use crate::error::DaemonizeError;
use crate::supervisor::PidFile;

/// Marks a process started by a [`Daemonizer`].
pub const DAEMON_CHILD_ENV: &str = "FLEET_DAEMON_CHILD";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn is_daemon_child() -> bool {
    std::env::var_os(DAEMON_CHILD_ENV).is_some()
}

#[derive(Debug, Clone)]
pub struct DaemonRequest {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Where the child records itself once it is running.
    pub pid_file: PathBuf,
    /// Pointed to when the child dies before becoming ready.
    pub log_file: PathBuf,
    pub ready_timeout: Duration,
}

impl DaemonRequest {
    /// Re-executes the running binary with `args`.
    pub fn current_exe(
        args: Vec<String>,
        pid_file: PathBuf,
        log_file: PathBuf,
    ) -> Result<Self, DaemonizeError> {
        Ok(Self {
            exe: std::env::current_exe().map_err(DaemonizeError::CurrentExe)?,
            args,
            env: Vec::new(),
            pid_file,
            log_file,
            ready_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
pub trait Daemonizer: Send + Sync {
    /// Starts the detached child and returns its PID file record once ready.
    async fn daemonize(&self, request: &DaemonRequest) -> Result<DaemonInfo, DaemonizeError>;
}

/// Starts the child in a new session, detached from the terminal.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDaemonizer;

#[cfg(unix)]
#[async_trait]
impl Daemonizer for SessionDaemonizer {
    async fn daemonize(&self, request: &DaemonRequest) -> Result<DaemonInfo, DaemonizeError> {
        let mut command = base_command(request);
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        launch_and_wait(command, request).await
    }
}

/// Starts the child detached from the console in its own process group.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedDaemonizer;

#[cfg(windows)]
#[async_trait]
impl Daemonizer for DetachedDaemonizer {
    async fn daemonize(&self, request: &DaemonRequest) -> Result<DaemonInfo, DaemonizeError> {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

        let mut command = base_command(request);
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        launch_and_wait(command, request).await
    }
}

#[cfg(not(any(unix, windows)))]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDaemonizer;

#[cfg(not(any(unix, windows)))]
#[async_trait]
impl Daemonizer for UnsupportedDaemonizer {
    async fn daemonize(&self, _request: &DaemonRequest) -> Result<DaemonInfo, DaemonizeError> {
        Err(DaemonizeError::Unsupported)
    }
}

/// The daemonizer for the current platform.
pub fn platform_daemonizer() -> Box<dyn Daemonizer> {
    #[cfg(unix)]
    return Box::new(SessionDaemonizer);
    #[cfg(windows)]
    return Box::new(DetachedDaemonizer);
    #[cfg(not(any(unix, windows)))]
    return Box::new(UnsupportedDaemonizer);
}

fn base_command(request: &DaemonRequest) -> Command {
    let mut command = Command::new(&request.exe);
    command
        .args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(DAEMON_CHILD_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    command
}

async fn launch_and_wait(
    mut command: Command,
    request: &DaemonRequest,
) -> Result<DaemonInfo, DaemonizeError> {
    let mut child = command.spawn().map_err(DaemonizeError::Spawn)?;
    let child_pid = child.id().unwrap_or_default();
    debug!(pid = child_pid, exe = %request.exe.display(), "Spawned daemon, waiting for PID file");

    let pid_file = PidFile::new(&request.pid_file);
    let deadline = Instant::now() + request.ready_timeout;

    loop {
        if let Some(status) = child.try_wait().map_err(DaemonizeError::Spawn)? {
            return Err(DaemonizeError::ExitedEarly {
                status: status.to_string(),
                log: request.log_file.clone(),
            });
        }

        // A partially written or foreign record is just "not ready yet".
        if let Ok(Some(info)) = pid_file.read() {
            if info.pid == child_pid {
                return Ok(info);
            }
        }

        if Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(DaemonizeError::Timeout(request.ready_timeout));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str, pid_file: PathBuf, timeout: Duration) -> DaemonRequest {
        DaemonRequest {
            exe: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("PID_FILE".to_string(), pid_file.display().to_string())],
            log_file: pid_file.with_file_name("worker.log"),
            pid_file,
            ready_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_ready_when_child_writes_own_pid() {
        let dir = tempdir().unwrap();
        let script = r#"printf '{"pid":%d,"queue_id":"q1","worker_dir":"/tmp","log_file":"/tmp/worker.log","pid_file":"/tmp/worker.pid","started_at":"2026-01-01T00:00:00Z","deployment_type":"daemon"}' $$ > "$PID_FILE.tmp" && mv "$PID_FILE.tmp" "$PID_FILE"; sleep 2"#;
        let request = shell(script, dir.path().join("worker.pid"), Duration::from_secs(5));

        let info = SessionDaemonizer.daemonize(&request).await.unwrap();
        assert_eq!(info.queue_id.as_str(), "q1");
        assert!(info.pid > 0);
    }

    #[tokio::test]
    async fn test_early_exit_reported() {
        let dir = tempdir().unwrap();
        let request = shell("exit 3", dir.path().join("worker.pid"), Duration::from_secs(5));

        let err = SessionDaemonizer.daemonize(&request).await.unwrap_err();
        assert!(matches!(err, DaemonizeError::ExitedEarly { .. }));
    }

    #[tokio::test]
    async fn test_timeout_when_never_ready() {
        let dir = tempdir().unwrap();
        let request = shell("sleep 5", dir.path().join("worker.pid"), Duration::from_millis(300));

        let err = SessionDaemonizer.daemonize(&request).await.unwrap_err();
        assert!(matches!(err, DaemonizeError::Timeout(_)));
    }
}
