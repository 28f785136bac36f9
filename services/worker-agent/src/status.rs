//! Out-of-process `status` and `stop` for a worker directory.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use fleet_model::DaemonInfo;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::supervisor::process::{self, StopSignal};
use crate::supervisor::PidFile;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatusReport {
    NotRunning,
    /// A PID file named a process that no longer exists; it was removed.
    Stale { pid: u32 },
    Running {
        info: DaemonInfo,
        uptime: chrono::Duration,
        log_size: Option<u64>,
    },
}

/// Reports on the supervisor recorded in `worker_dir`.
pub fn status(worker_dir: &Path) -> Result<WorkerStatusReport, SupervisorError> {
    let pid_file = PidFile::in_dir(worker_dir);
    let Some(info) = pid_file.read()? else {
        return Ok(WorkerStatusReport::NotRunning);
    };

    if !process::is_alive(info.pid) {
        info!(pid = info.pid, "Removing stale PID file");
        pid_file.remove()?;
        return Ok(WorkerStatusReport::Stale { pid: info.pid });
    }

    let log_size = std::fs::metadata(&info.log_file).ok().map(|m| m.len());
    Ok(WorkerStatusReport::Running {
        uptime: info.uptime_at(Utc::now()),
        log_size,
        info,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    NotRunning,
    Stale { pid: u32 },
    Stopped { pid: u32, forced: bool },
}

/// Stops the supervisor recorded in `worker_dir`: SIGTERM (or SIGKILL with
/// `force`), then SIGKILL if it is still alive after `grace`.
///
/// Whenever the supervisor is killed rather than stopped, the recorded
/// worker process group is killed first; a killed supervisor cannot stop it.
pub async fn stop(worker_dir: &Path, grace: Duration, force: bool) -> Result<StopReport, SupervisorError> {
    let pid_file = PidFile::in_dir(worker_dir);
    let Some(info) = pid_file.read()? else {
        return Ok(StopReport::NotRunning);
    };
    let pid = info.pid;

    if !process::is_alive(pid) {
        kill_orphaned_group(&info)?;
        pid_file.remove()?;
        return Ok(StopReport::Stale { pid });
    }

    let mut forced = force;
    if force {
        kill_worker_group(&info)?;
        info!(pid, "Killing supervisor");
        process::signal_process(pid, StopSignal::Kill)?;
    } else {
        info!(pid, "Stopping worker");
        process::signal_process(pid, StopSignal::Terminate)?;
    }

    if !wait_for_exit(pid, grace).await {
        warn!(pid, grace_secs = grace.as_secs(), "Worker still running, sending SIGKILL");
        kill_worker_group(&info)?;
        process::signal_process(pid, StopSignal::Kill)?;
        forced = true;
        if !wait_for_exit(pid, Duration::from_secs(5)).await {
            return Err(SupervisorError::Signal(format!(
                "pid {pid} survived SIGKILL"
            )));
        }
    }

    // A supervisor that stopped cleanly has taken its group down already.
    kill_orphaned_group(&info)?;
    pid_file.remove()?;
    Ok(StopReport::Stopped { pid, forced })
}

fn kill_worker_group(info: &DaemonInfo) -> Result<(), SupervisorError> {
    if let Some(pgid) = info.worker_pgid {
        info!(pgid, "Killing worker process group");
        process::signal_group(pgid, StopSignal::Kill)?;
    }
    Ok(())
}

/// Kills a worker group whose supervisor is gone.
fn kill_orphaned_group(info: &DaemonInfo) -> Result<(), SupervisorError> {
    match info.worker_pgid {
        Some(pgid) if process::group_alive(pgid) => {
            warn!(pgid, "Worker outlived its supervisor");
            process::signal_group(pgid, StopSignal::Kill)
        }
        _ => Ok(()),
    }
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !process::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

/// Human-readable byte size.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// `1h 2m 3s` style duration.
pub fn format_uptime(uptime: chrono::Duration) -> String {
    let total = uptime.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::QueueId;
    use fleet_model::DeploymentType;
    use rstest::rstest;
    use tempfile::tempdir;

    fn record(dir: &Path, pid: u32) -> DaemonInfo {
        DaemonInfo {
            pid,
            worker_pgid: None,
            queue_id: QueueId::new("q1").unwrap(),
            worker_dir: dir.to_path_buf(),
            log_file: dir.join("worker.log"),
            pid_file: dir.join("worker.pid"),
            started_at: Utc::now() - chrono::Duration::seconds(90),
            deployment_type: DeploymentType::Daemon,
        }
    }

    #[test]
    fn test_status_not_running() {
        let dir = tempdir().unwrap();
        assert_eq!(status(dir.path()).unwrap(), WorkerStatusReport::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn test_status_running_for_live_pid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("worker.log"), b"hello").unwrap();
        PidFile::in_dir(dir.path())
            .write(&record(dir.path(), std::process::id()))
            .unwrap();

        match status(dir.path()).unwrap() {
            WorkerStatusReport::Running { uptime, log_size, .. } => {
                assert!(uptime.num_seconds() >= 90);
                assert_eq!(log_size, Some(5));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_pid_file_cleaned_up() {
        let dir = tempdir().unwrap();
        let pid_file = PidFile::in_dir(dir.path());
        // Reap a short-lived child so its pid is known to be dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        pid_file.write(&record(dir.path(), dead)).unwrap();

        assert_eq!(
            stop(dir.path(), Duration::from_secs(1), false).await.unwrap(),
            StopReport::Stale { pid: dead }
        );
        assert!(!pid_file.path().exists());
        assert_eq!(status(dir.path()).unwrap(), WorkerStatusReport::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_recorded_process() {
        let dir = tempdir().unwrap();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        PidFile::in_dir(dir.path())
            .write(&record(dir.path(), pid))
            .unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        let report = stop(dir.path(), Duration::from_secs(5), false).await.unwrap();
        assert_eq!(report, StopReport::Stopped { pid, forced: false });
        assert!(reaper.await.unwrap().is_ok());
        assert!(!PidFile::in_dir(dir.path()).path().exists());
    }

    /// A worker in its own group that leaves a grandchild behind.
    #[cfg(unix)]
    fn spawn_worker_group(dir: &Path) -> (tokio::process::Child, u32) {
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 60 & echo $! > gc.pid; wait")
            .current_dir(dir)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap();
        (child, pgid)
    }

    #[cfg(unix)]
    async fn grandchild(dir: &Path) -> u32 {
        let path = dir.join("gc.pid");
        for _ in 0..100 {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker never wrote gc.pid");
    }

    /// Zombies waiting on a reaper count as gone.
    #[cfg(unix)]
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => process::is_alive(pid),
        }
    }

    #[cfg(unix)]
    async fn assert_gone(pid: u32) {
        for _ in 0..100 {
            if !running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pid {pid} still alive");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_stop_kills_worker_group() {
        let dir = tempdir().unwrap();
        let (mut worker, pgid) = spawn_worker_group(dir.path());
        let gc = grandchild(dir.path()).await;

        let agent = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let agent_pid = agent.id().unwrap();
        let agent = tokio::spawn(async move {
            let mut agent = agent;
            agent.wait().await
        });

        let mut info = record(dir.path(), agent_pid);
        info.worker_pgid = Some(pgid);
        PidFile::in_dir(dir.path()).write(&info).unwrap();

        let report = stop(dir.path(), Duration::from_secs(5), true).await.unwrap();
        assert_eq!(report, StopReport::Stopped { pid: agent_pid, forced: true });
        assert!(agent.await.unwrap().is_ok());
        assert!(worker.wait().await.is_ok());
        assert_gone(gc).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escalated_stop_kills_worker_group() {
        let dir = tempdir().unwrap();
        let (mut worker, pgid) = spawn_worker_group(dir.path());
        let gc = grandchild(dir.path()).await;

        // A supervisor that ignores SIGTERM.
        let agent = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .unwrap();
        let agent_pid = agent.id().unwrap();
        let agent = tokio::spawn(async move {
            let mut agent = agent;
            agent.wait().await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut info = record(dir.path(), agent_pid);
        info.worker_pgid = Some(pgid);
        PidFile::in_dir(dir.path()).write(&info).unwrap();

        let report = stop(dir.path(), Duration::from_millis(600), false).await.unwrap();
        assert_eq!(report, StopReport::Stopped { pid: agent_pid, forced: true });
        assert!(agent.await.unwrap().is_ok());
        assert!(worker.wait().await.is_ok());
        assert_gone(gc).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_record_kills_orphaned_group() {
        let dir = tempdir().unwrap();
        let (mut worker, pgid) = spawn_worker_group(dir.path());
        let gc = grandchild(dir.path()).await;

        let mut dead = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = dead.id();
        dead.wait().unwrap();

        let mut info = record(dir.path(), dead_pid);
        info.worker_pgid = Some(pgid);
        PidFile::in_dir(dir.path()).write(&info).unwrap();

        let report = stop(dir.path(), Duration::from_secs(1), false).await.unwrap();
        assert_eq!(report, StopReport::Stale { pid: dead_pid });
        assert!(worker.wait().await.is_ok());
        assert_gone(gc).await;
    }

    #[rstest]
    #[case(512, "512 B")]
    #[case(2048, "2.0 KiB")]
    #[case(100 * 1024 * 1024, "100.0 MiB")]
    fn test_format_size(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_size(bytes), expected);
    }

    #[rstest]
    #[case(5, "5s")]
    #[case(125, "2m 5s")]
    #[case(3725, "1h 2m 5s")]
    fn test_format_uptime(#[case] secs: i64, #[case] expected: &str) {
        assert_eq!(format_uptime(chrono::Duration::seconds(secs)), expected);
    }
}
