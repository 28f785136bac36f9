//! Signals for process groups and single processes.

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopSignal::Terminate => write!(f, "SIGTERM"),
            StopSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    use super::StopSignal;
    use crate::error::SupervisorError;

    fn to_signal(signal: StopSignal) -> Signal {
        match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    fn to_pid(pid: u32) -> Result<Pid, SupervisorError> {
        i32::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| SupervisorError::Signal(format!("invalid pid {pid}")))
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        match kill(pid, None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn group_alive(pgid: u32) -> bool {
        let Ok(pgid) = to_pid(pgid) else {
            return false;
        };
        match killpg(pgid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn signal_group(pgid: u32, signal: StopSignal) -> Result<(), SupervisorError> {
        match killpg(to_pid(pgid)?, to_signal(signal)) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Signal(format!(
                "{signal} to group {pgid}: {e}"
            ))),
        }
    }

    pub fn signal_process(pid: u32, signal: StopSignal) -> Result<(), SupervisorError> {
        match kill(to_pid(pid)?, to_signal(signal)) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Signal(format!("{signal} to {pid}: {e}"))),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::StopSignal;
    use crate::error::SupervisorError;

    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn group_alive(_pgid: u32) -> bool {
        false
    }

    pub fn signal_group(_pgid: u32, _signal: StopSignal) -> Result<(), SupervisorError> {
        Err(SupervisorError::Signal(
            "process groups are not supported on this platform".to_string(),
        ))
    }

    pub fn signal_process(_pid: u32, _signal: StopSignal) -> Result<(), SupervisorError> {
        Err(SupervisorError::Signal(
            "signals are not supported on this platform".to_string(),
        ))
    }
}

/// Whether a process with `pid` exists.
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}

/// Whether any process is left in group `pgid`.
pub fn group_alive(pgid: u32) -> bool {
    imp::group_alive(pgid)
}

/// Sends `signal` to every process in group `pgid`. A group that is already
/// gone counts as signalled.
pub fn signal_group(pgid: u32, signal: StopSignal) -> Result<(), SupervisorError> {
    imp::signal_group(pgid, signal)
}

pub fn signal_process(pid: u32, signal: StopSignal) -> Result<(), SupervisorError> {
    imp::signal_process(pid, signal)
}
