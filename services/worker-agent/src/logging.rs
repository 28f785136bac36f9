//! Tracing setup for the worker agent.
//!
//! In the foreground events go to stderr. A daemon has no terminal, so its
//! events are written into the worker's rotating log next to the worker's
//! own output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::supervisor::SharedLog;

/// `RUST_LOG` wins, then the configured level, then `info`.
pub fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_stderr(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn init_daemon(level: Option<&str>, log: SharedLog) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(log),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn test_invalid_level_falls_back() {
        // Must not panic on garbage.
        let _ = filter(Some("[[not a filter"));
        let _ = filter(None);
    }

    #[test]
    fn test_daemon_writer_targets_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::open(dir.path().join("worker.log"), 1024, 1).unwrap();

        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_ansi(false)
            .with_writer(log.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(queue_id = "q1", "Worker started");
        });

        use std::io::Write;
        log.make_writer().flush().unwrap();
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("\"queue_id\":\"q1\""));
        assert!(contents.contains("Worker started"));
    }
}
