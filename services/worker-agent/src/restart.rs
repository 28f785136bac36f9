//! How the coordinator gets the worker to pick up an update.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::RestartError;
use crate::supervisor::ProcessSupervisor;

/// Something that can restart the worker gracefully.
#[async_trait]
pub trait RestartRequester: Send + Sync {
    async fn request_restart(&self, reason: &str) -> Result<(), RestartError>;
}

/// Restarts the locally supervised worker process.
#[derive(Debug, Clone)]
pub struct SupervisorRestart {
    supervisor: Arc<ProcessSupervisor>,
}

impl SupervisorRestart {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl RestartRequester for SupervisorRestart {
    async fn request_restart(&self, reason: &str) -> Result<(), RestartError> {
        info!(reason, "Restarting worker");
        self.supervisor
            .log()
            .supervisor_line(&format!("Restarting worker: {reason}"));
        let pid = self.supervisor.restart().await?;
        info!(pid, "Worker restarted");
        Ok(())
    }
}

/// Sends SIGTERM to the current process, leaving the restart to whatever
/// runs it (a cluster orchestrator or an outer supervisor).
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSelf;

#[async_trait]
impl RestartRequester for SignalSelf {
    async fn request_restart(&self, reason: &str) -> Result<(), RestartError> {
        let pid = std::process::id();
        info!(reason, pid, "Terminating self for restart");
        signal_self(pid)
    }
}

#[cfg(unix)]
fn signal_self(pid: u32) -> Result<(), RestartError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| RestartError::Signal(e.to_string()))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| RestartError::Signal(e.to_string()))
}

#[cfg(not(unix))]
fn signal_self(_pid: u32) -> Result<(), RestartError> {
    Err(RestartError::Unsupported)
}
