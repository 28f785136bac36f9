//! A worker that exits immediately is restarted a bounded number of times.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test crash_loop
//! ```

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use fleet_id::QueueId;
use fleet_worker::supervisor::{BackoffPolicy, RestartPolicy};
use fleet_worker::{
    LaunchSpec, ProcessSupervisor, RunOutcome, RunnerConfig, ShutdownTrigger, SupervisorConfig,
    SupervisorOutcome, SupervisorState, WorkerRunner,
};
use tempfile::tempdir;

#[tokio::test]
async fn test_crash_loop_ends_in_failed() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fleet_worker=debug")
        .with_test_writer()
        .try_init();

    let dir = tempdir().unwrap();
    let config = SupervisorConfig {
        restart: RestartPolicy {
            max_attempts: 3,
            stable_uptime: Duration::from_secs(600),
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(100),
            },
        },
        ..SupervisorConfig::default()
    };
    // Counts its own launches; would exit five times in a row given the chance.
    let script = "echo run >> runs; exit 1";
    let spec = LaunchSpec::new(QueueId::new("q1").unwrap(), "/bin/sh", dir.path())
        .arg("-c")
        .arg(script);

    let supervisor = Arc::new(ProcessSupervisor::start(config, spec).unwrap());
    let mut states = supervisor.subscribe();
    let runner = WorkerRunner::new(supervisor.clone(), RunnerConfig::default());
    let (_trigger, signal) = ShutdownTrigger::new();

    let outcome = tokio::time::timeout(Duration::from_secs(20), runner.run(signal))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::CrashLoop { attempts: 3 });
    assert_eq!(supervisor.wait().await, SupervisorOutcome::Failed { attempts: 3 });
    assert_eq!(*states.borrow_and_update(), SupervisorState::Failed { attempts: 3 });
    assert_eq!(supervisor.restarts(), 3);

    // The initial launch plus three restarts, nothing after giving up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let runs = std::fs::read_to_string(dir.path().join("runs")).unwrap();
    assert_eq!(runs.lines().count(), 4);
    assert!(dir.path().join("worker.pid").exists());
}
