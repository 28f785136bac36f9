//! `worker.pid`: the JSON-encoded [`DaemonInfo`] of a running supervisor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fleet_model::DaemonInfo;
use thiserror::Error;

pub const PID_FILE_NAME: &str = "worker.pid";
pub const LOG_FILE_NAME: &str = "worker.log";

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("{path}: corrupt pid file: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The pid file inside `worker_dir`.
    pub fn in_dir(worker_dir: &Path) -> Self {
        Self::new(worker_dir.join(PID_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `info` through a temporary file and a rename, so readers never
    /// see a partial record.
    pub fn write(&self, info: &DaemonInfo) -> Result<(), PidFileError> {
        let json = serde_json::to_vec_pretty(info).map_err(|source| PidFileError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(|source| self.io(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io(source))
    }

    /// Reads the record, `None` when no pid file exists.
    pub fn read(&self) -> Result<Option<DaemonInfo>, PidFileError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io(source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PidFileError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Removes the pid file; a missing file is not an error.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(self.io(e)),
            _ => Ok(()),
        }
    }

    fn io(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_id::QueueId;
    use fleet_model::DeploymentType;
    use tempfile::tempdir;

    fn info(dir: &Path) -> DaemonInfo {
        DaemonInfo {
            pid: 1234,
            worker_pgid: Some(1235),
            queue_id: QueueId::new("q1").unwrap(),
            worker_dir: dir.to_path_buf(),
            log_file: dir.join(LOG_FILE_NAME),
            pid_file: dir.join(PID_FILE_NAME),
            started_at: Utc::now(),
            deployment_type: DeploymentType::Foreground,
        }
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempdir().unwrap();
        let pid_file = PidFile::in_dir(dir.path());
        assert!(pid_file.read().unwrap().is_none());

        let record = info(dir.path());
        pid_file.write(&record).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(record));

        pid_file.remove().unwrap();
        assert!(!pid_file.path().exists());
        pid_file.remove().unwrap();
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempdir().unwrap();
        let pid_file = PidFile::in_dir(dir.path());
        fs::write(pid_file.path(), b"12345").unwrap();

        assert!(matches!(
            pid_file.read(),
            Err(PidFileError::Corrupt { .. })
        ));
    }
}
