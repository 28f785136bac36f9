//! Size-bounded rotating log for worker output.
//!
//! The active file never grows beyond `max_size`. When a write would cross
//! the bound the file is rotated: `worker.log.N-1 -> worker.log.N`, ...,
//! `worker.log -> worker.log.1`, and the oldest backup is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Rotating log writer.
#[derive(Debug)]
pub struct RotatingLog {
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    max_backups: usize,
}

impl RotatingLog {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>, max_size: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = Self::open_append(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            max_size: max_size.max(1),
            max_backups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the active file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of backup number `index` (1 is the newest).
    pub fn backup_path(&self, index: usize) -> PathBuf {
        backup_path(&self.path, index)
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        remove_if_exists(&self.backup_path(self.max_backups))?;
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = Self::open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.max_size.saturating_sub(self.size);
            if (rest.len() as u64) > room && self.size > 0 {
                self.rotate()?;
                continue;
            }
            // Only a chunk larger than an empty file gets split.
            let take = rest.len().min(room.max(1) as usize);
            let written = self.file.write(&rest[..take])?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.size += written as u64;
            rest = &rest[written..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// =============================================================================
// Shared handle
// =============================================================================

/// Cloneable handle to one [`RotatingLog`], shared by the output pumps, the
/// supervisor's own lines and (in daemon mode) the tracing subscriber.
#[derive(Debug, Clone)]
pub struct SharedLog(Arc<Mutex<RotatingLog>>);

impl SharedLog {
    pub fn new(log: RotatingLog) -> Self {
        Self(Arc::new(Mutex::new(log)))
    }

    pub fn open(path: impl Into<PathBuf>, max_size: u64, max_backups: usize) -> io::Result<Self> {
        RotatingLog::open(path, max_size, max_backups).map(Self::new)
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path().to_path_buf()
    }

    pub fn size(&self) -> u64 {
        self.lock().size()
    }

    /// Writes one `[supervisor]` lifecycle line.
    pub fn supervisor_line(&self, message: &str) {
        let line = format!(
            "[{}] [supervisor] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        );
        let mut log = self.lock();
        // The log is best effort; tracing carries the same event.
        let _ = log.write_all(line.as_bytes());
        let _ = log.flush();
    }

    fn lock(&self) -> MutexGuard<'_, RotatingLog> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLog {
    type Writer = SharedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn file_len(path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.log");
        fs::write(&path, b"old\n").unwrap();

        let mut log = RotatingLog::open(&path, 1024, 2).unwrap();
        assert_eq!(log.size(), 4);
        log.write_all(b"new\n").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }

    #[test]
    fn test_rotates_before_exceeding_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.log");

        let mut log = RotatingLog::open(&path, 10, 2).unwrap();
        log.write_all(b"aaaaaaaa").unwrap();
        log.write_all(b"bbbb").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(log.backup_path(1)).unwrap(), "aaaaaaaa");
        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbb");
    }

    #[test]
    fn test_drops_oldest_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.log");

        let mut log = RotatingLog::open(&path, 4, 2).unwrap();
        for chunk in [b"1111", b"2222", b"3333", b"4444"] {
            log.write_all(chunk).unwrap();
        }
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "4444");
        assert_eq!(fs::read_to_string(log.backup_path(1)).unwrap(), "3333");
        assert_eq!(fs::read_to_string(log.backup_path(2)).unwrap(), "2222");
        assert!(!log.backup_path(3).exists());
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.log");

        let mut log = RotatingLog::open(&path, 4, 0).unwrap();
        log.write_all(b"1111").unwrap();
        log.write_all(b"22").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "22");
        assert!(!log.backup_path(1).exists());
    }

    #[test]
    fn test_supervisor_line_prefix() {
        let dir = tempdir().unwrap();
        let log = SharedLog::open(dir.path().join("worker.log"), 1024, 1).unwrap();
        log.supervisor_line("Worker started (pid 42)");

        let contents = fs::read_to_string(log.path()).unwrap();
        assert!(contents.starts_with('['));
        assert!(contents.ends_with("[supervisor] Worker started (pid 42)\n"));
    }

    proptest! {
        #[test]
        fn prop_rotation_respects_bounds(
            max_size in 1u64..64,
            max_backups in 0usize..4,
            writes in proptest::collection::vec(1usize..100, 1..40),
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("worker.log");
            let mut log = RotatingLog::open(&path, max_size, max_backups).unwrap();

            for len in writes {
                log.write_all(&vec![b'x'; len]).unwrap();
                log.flush().unwrap();
                prop_assert!(file_len(&path) <= max_size);
            }
            for index in 1..=max_backups {
                prop_assert!(file_len(&log.backup_path(index)) <= max_size);
            }
            prop_assert!(!log.backup_path(max_backups + 1).exists());
        }
    }
}
