//! Coordinated worker updates: one worker detecting and applying a package
//! update, then two workers competing for the same queue lock.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test update_flow
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{QueueId, WorkerId};
use fleet_model::{UpdateKind, UpdateTrigger, WorkerStatus};
use fleet_testing::{active_queue, FakeControlPlane};
use fleet_worker::package::{PackageManager, PackageSpec, VersionCache};
use fleet_worker::restart::RestartRequester;
use fleet_worker::{
    CoordinatorConfig, MonitorConfig, PackageError, RestartError, ShutdownSignal, ShutdownTrigger,
    UpdateCoordinator, UpdateMonitor, UpdateOutcome,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fleet_worker=debug")
        .with_test_writer()
        .try_init();
}

/// Records installs into one shared environment.
#[derive(Default)]
struct RecordingPackages {
    installed: Mutex<Option<String>>,
    installs: Mutex<Vec<String>>,
}

#[async_trait]
impl PackageManager for RecordingPackages {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn install(&self, _env: &Path, spec: &PackageSpec, _force: bool) -> Result<(), PackageError> {
        self.installs.lock().unwrap().push(spec.render());
        if let Some(version) = spec.version.exact() {
            *self.installed.lock().unwrap() = Some(version.to_string());
        }
        Ok(())
    }

    async fn installed_version(&self, _env: &Path, _package: &str) -> Result<Option<String>, PackageError> {
        Ok(self.installed.lock().unwrap().clone())
    }
}

/// A restart that takes `downtime`, after which the worker reports active
/// again.
struct RegisteringRestart {
    control_plane: Arc<FakeControlPlane>,
    queue_id: QueueId,
    worker_id: WorkerId,
    downtime: Duration,
    restarts: Mutex<u32>,
}

#[async_trait]
impl RestartRequester for RegisteringRestart {
    async fn request_restart(&self, _reason: &str) -> Result<(), RestartError> {
        *self.restarts.lock().unwrap() += 1;
        self.control_plane
            .set_worker_status(&self.queue_id, &self.worker_id, WorkerStatus::Offline);

        let control_plane = self.control_plane.clone();
        let (queue_id, worker_id, downtime) =
            (self.queue_id.clone(), self.worker_id.clone(), self.downtime);
        tokio::spawn(async move {
            tokio::time::sleep(downtime).await;
            control_plane.set_worker_status(&queue_id, &worker_id, WorkerStatus::Active);
        });
        Ok(())
    }
}

struct Worker {
    id: WorkerId,
    coordinator: Arc<UpdateCoordinator>,
    restarter: Arc<RegisteringRestart>,
}

fn worker(
    control_plane: &Arc<FakeControlPlane>,
    packages: &Arc<RecordingPackages>,
    queue_id: &QueueId,
    host: &str,
    downtime: Duration,
) -> Worker {
    let id = WorkerId::for_queue(queue_id, Some(host));
    control_plane.set_worker_status(queue_id, &id, WorkerStatus::Active);

    let restarter = Arc::new(RegisteringRestart {
        control_plane: control_plane.clone(),
        queue_id: queue_id.clone(),
        worker_id: id.clone(),
        downtime,
        restarts: Mutex::new(0),
    });
    let coordinator = UpdateCoordinator::new(
        CoordinatorConfig::new(queue_id.clone(), id.clone(), "/srv/fleet/venv"),
        control_plane.clone(),
        control_plane.clone(),
        packages.clone(),
        restarter.clone(),
    )
    .with_version_cache(VersionCache::disabled());

    Worker {
        id,
        coordinator: Arc::new(coordinator),
        restarter,
    }
}

#[tokio::test(start_paused = true)]
async fn test_package_update_is_detected_applied_and_healthy() {
    init_tracing();

    let control_plane = Arc::new(FakeControlPlane::new());
    let packages = Arc::new(RecordingPackages::default());
    *packages.installed.lock().unwrap() = Some("0.4.0".to_string());

    let q1 = QueueId::new("q1").unwrap();
    control_plane.upsert_queue(active_queue("q1", "v1"));
    control_plane.set_package_version(&q1, Some("0.4.0"));

    let w1 = worker(&control_plane, &packages, &q1, "w1", Duration::from_secs(8));

    let (shutdown, signal) = ShutdownTrigger::new();
    let mut monitor = UpdateMonitor::new(
        control_plane.clone(),
        MonitorConfig {
            queue_id: q1.clone(),
            interval: Duration::from_secs(60),
        },
    );
    let mut triggers = monitor.update_chan();
    monitor.start(signal.clone());

    // Baseline is recorded on the first poll.
    tokio::time::sleep(Duration::from_secs(1)).await;
    control_plane.set_package_version(&q1, Some("0.5.0"));

    let trigger = tokio::time::timeout(Duration::from_secs(120), triggers.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trigger.kind, UpdateKind::Package);
    assert_eq!(trigger.new_package_version.as_deref(), Some("0.5.0"));

    let outcome = w1.coordinator.coordinate_update(&trigger, &signal).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Applied { kind: UpdateKind::Package, .. }));

    assert_eq!(
        *packages.installs.lock().unwrap(),
        vec!["fleet-worker-runtime[worker]==0.5.0"]
    );
    assert_eq!(*w1.restarter.restarts.lock().unwrap(), 1);
    assert_eq!(control_plane.grants().len(), 1);
    assert_eq!(control_plane.releases(), vec![(q1.clone(), w1.id.clone())]);
    assert_eq!(control_plane.lock_holder(&q1), None);

    w1.coordinator
        .check_health(Duration::from_secs(60), &signal)
        .await
        .unwrap();

    shutdown.graceful();
    monitor.stop().await;
    assert_eq!(triggers.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_competing_workers_update_in_turn() {
    init_tracing();

    let control_plane = Arc::new(FakeControlPlane::new());
    let packages = Arc::new(RecordingPackages::default());
    let q1 = QueueId::new("q1").unwrap();
    control_plane.upsert_queue(active_queue("q1", "v1"));

    let w1 = worker(&control_plane, &packages, &q1, "w1", Duration::from_secs(5));
    let w2 = worker(&control_plane, &packages, &q1, "w2", Duration::from_secs(5));

    // W1's restart holds the lock for 45s; W2 retries every 30s.
    let slow_restart = Arc::new(SlowRestart {
        inner: w1.restarter.clone(),
        hold: Duration::from_secs(45),
    });
    let w1_coordinator = Arc::new(UpdateCoordinator::new(
        CoordinatorConfig::new(q1.clone(), w1.id.clone(), "/srv/fleet/venv"),
        control_plane.clone(),
        control_plane.clone(),
        packages.clone(),
        slow_restart,
    ));

    let trigger = UpdateTrigger::config("v2");
    let first = {
        let (coordinator, trigger) = (w1_coordinator.clone(), trigger.clone());
        tokio::spawn(async move {
            coordinator
                .coordinate_update(&trigger, &ShutdownSignal::never())
                .await
        })
    };
    // W1 reaches the lock service first.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(control_plane.lock_holder(&q1), Some(w1.id.clone()));

    let second = {
        let (coordinator, trigger) = (w2.coordinator.clone(), trigger.clone());
        tokio::spawn(async move {
            coordinator
                .coordinate_update(&trigger, &ShutdownSignal::never())
                .await
        })
    };

    assert!(matches!(first.await.unwrap().unwrap(), UpdateOutcome::Applied { .. }));
    assert_eq!(control_plane.lock_holder(&q1), None);
    assert!(matches!(second.await.unwrap().unwrap(), UpdateOutcome::Applied { .. }));

    let grants = control_plane.grants();
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].holder_id, w1.id);
    assert_eq!(grants[1].holder_id, w2.id);

    // W1 once, W2 at 0s and 30s (conflicts) then at 60s.
    assert_eq!(control_plane.calls().acquire, 4);
    assert_eq!(*w1.restarter.restarts.lock().unwrap(), 1);
    assert_eq!(*w2.restarter.restarts.lock().unwrap(), 1);
}

/// Delays a restart while the caller still holds the lock.
struct SlowRestart {
    inner: Arc<RegisteringRestart>,
    hold: Duration,
}

#[async_trait]
impl RestartRequester for SlowRestart {
    async fn request_restart(&self, reason: &str) -> Result<(), RestartError> {
        tokio::time::sleep(self.hold).await;
        self.inner.request_restart(reason).await
    }
}
