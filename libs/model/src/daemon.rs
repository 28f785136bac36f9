//! PID file contents of a supervised local worker.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fleet_id::QueueId;
use serde::{Deserialize, Serialize};

/// How the worker process was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    /// Attached to the invoking terminal.
    Foreground,
    /// Detached into its own session.
    Daemon,
    /// Running inside a cluster pod.
    Kubernetes,
}

/// Written to `<worker_dir>/worker.pid` after a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Pid of the supervising process.
    pub pid: u32,
    /// Process group of the current worker child. Rewritten on every
    /// restart so an out-of-process stop can reach the worker even when the
    /// supervisor is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pgid: Option<u32>,
    pub queue_id: QueueId,
    pub worker_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub started_at: DateTime<Utc>,
    pub deployment_type: DeploymentType,
}

impl DaemonInfo {
    pub fn uptime_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_names() {
        let info = DaemonInfo {
            pid: 4242,
            worker_pgid: Some(4243),
            queue_id: QueueId::new("q1").unwrap(),
            worker_dir: PathBuf::from("/tmp/w"),
            log_file: PathBuf::from("/tmp/w/worker.log"),
            pid_file: PathBuf::from("/tmp/w/worker.pid"),
            started_at: Utc::now(),
            deployment_type: DeploymentType::Daemon,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["queue_id"], "q1");
        assert_eq!(value["deployment_type"], "daemon");
        assert_eq!(value["log_file"], "/tmp/w/worker.log");
        assert_eq!(value["worker_pgid"], 4243);
    }

    #[test]
    fn test_worker_pgid_optional() {
        let info: DaemonInfo = serde_json::from_str(
            r#"{"pid":1,"queue_id":"q1","worker_dir":"/w","log_file":"/w/worker.log",
                "pid_file":"/w/worker.pid","started_at":"2026-01-01T00:00:00Z",
                "deployment_type":"foreground"}"#,
        )
        .unwrap();
        assert_eq!(info.worker_pgid, None);
        assert!(serde_json::to_value(&info).unwrap().get("worker_pgid").is_none());
    }
}
