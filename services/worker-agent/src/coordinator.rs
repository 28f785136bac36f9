//! Update coordinator.
//!
//! Applies one update trigger under the queue's update lock, so that at most
//! one worker of a queue restarts at a time:
//!
//! 1. acquire the lock, retrying while another worker holds it
//! 2. install the target package version (package updates) and restart
//! 3. release the lock on every exit path

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_control_plane::{LockOutcome, LockService, WorkerRegistry};
use fleet_id::{LockId, QueueId, WorkerId};
use fleet_model::{UpdateKind, UpdateLock, UpdateTrigger};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::CoordinatorError;
use crate::package::{
    compare_versions, PackageManager, PackageSpec, VersionCache, VersionReq, DEFAULT_EXTRAS,
    DEFAULT_PACKAGE,
};
use crate::restart::RestartRequester;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue_id: QueueId,
    pub worker_id: WorkerId,

    /// Lifetime requested for the update lock.
    pub lock_duration: Duration,
    /// Acquisition attempts before the update is deferred.
    pub lock_retries: u32,
    pub lock_retry_delay: Duration,

    pub health_poll_interval: Duration,

    /// Virtual environment the worker package lives in.
    pub venv: PathBuf,
    pub package_name: String,
    pub extras: Option<String>,
    pub allow_downgrade: bool,
    pub force_reinstall: bool,
}

impl CoordinatorConfig {
    pub fn new(queue_id: QueueId, worker_id: WorkerId, venv: impl Into<PathBuf>) -> Self {
        Self {
            queue_id,
            worker_id,
            lock_duration: Duration::from_secs(300),
            lock_retries: 10,
            lock_retry_delay: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(5),
            venv: venv.into(),
            package_name: DEFAULT_PACKAGE.to_string(),
            extras: Some(DEFAULT_EXTRAS.to_string()),
            allow_downgrade: false,
            force_reinstall: false,
        }
    }
}

/// Result of a coordinated update that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { kind: UpdateKind, lock_id: LockId },
    /// The lock stayed with another worker; the caller keeps running the
    /// current version.
    Deferred {
        attempts: u32,
        holder: Option<WorkerId>,
    },
}

pub struct UpdateCoordinator {
    config: CoordinatorConfig,
    locks: Arc<dyn LockService>,
    registry: Arc<dyn WorkerRegistry>,
    packages: Arc<dyn PackageManager>,
    restarter: Arc<dyn RestartRequester>,
    versions: VersionCache,
}

impl UpdateCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        locks: Arc<dyn LockService>,
        registry: Arc<dyn WorkerRegistry>,
        packages: Arc<dyn PackageManager>,
        restarter: Arc<dyn RestartRequester>,
    ) -> Self {
        Self {
            config,
            locks,
            registry,
            packages,
            restarter,
            versions: VersionCache::default(),
        }
    }

    pub fn with_version_cache(mut self, versions: VersionCache) -> Self {
        self.versions = versions;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Applies `trigger` under the update lock.
    #[instrument(skip(self, trigger, shutdown), fields(queue_id = %self.config.queue_id, kind = %trigger.kind))]
    pub async fn coordinate_update(
        &self,
        trigger: &UpdateTrigger,
        shutdown: &ShutdownSignal,
    ) -> Result<UpdateOutcome, CoordinatorError> {
        let mut shutdown = shutdown.clone();

        let lock = match self.acquire_lock(&mut shutdown).await? {
            Acquisition::Acquired(lock) => lock,
            Acquisition::Exhausted { attempts, holder } => {
                warn!(
                    attempts,
                    holder = holder.as_ref().map(WorkerId::as_str).unwrap_or("unknown"),
                    "Update lock unavailable, deferring update"
                );
                return Ok(UpdateOutcome::Deferred { attempts, holder });
            }
        };
        info!(lock_id = %lock.lock_id, "Acquired update lock");

        let guard = HeldLock::new(
            self.locks.clone(),
            self.config.queue_id.clone(),
            self.config.worker_id.clone(),
        );

        let result = tokio::select! {
            result = self.perform(trigger) => result,
            _ = shutdown.requested() => Err(CoordinatorError::Cancelled),
        };
        guard.release().await;

        result?;
        info!(lock_id = %lock.lock_id, "Update applied");
        Ok(UpdateOutcome::Applied {
            kind: trigger.kind,
            lock_id: lock.lock_id,
        })
    }

    async fn acquire_lock(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Acquisition, CoordinatorError> {
        let attempts = self.config.lock_retries.max(1);
        let duration_seconds = self.config.lock_duration.as_secs();
        let mut holder = None;

        for attempt in 1..=attempts {
            debug!(attempt, attempts, "Acquiring update lock");
            match self
                .locks
                .acquire(&self.config.queue_id, &self.config.worker_id, duration_seconds)
                .await
            {
                Ok(LockOutcome::Acquired(lock)) => return Ok(Acquisition::Acquired(lock)),
                Ok(LockOutcome::Conflict { holder: current }) => {
                    info!(
                        attempt,
                        attempts,
                        holder = current.as_ref().map(WorkerId::as_str).unwrap_or("unknown"),
                        "Update lock held by another worker"
                    );
                    holder = current;
                }
                Err(e) => return Err(CoordinatorError::LockUnavailable(e)),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.lock_retry_delay) => {}
                    _ = shutdown.requested() => return Err(CoordinatorError::Cancelled),
                }
            }
        }

        Ok(Acquisition::Exhausted { attempts, holder })
    }

    async fn perform(&self, trigger: &UpdateTrigger) -> Result<(), CoordinatorError> {
        match trigger.kind {
            UpdateKind::Config => {
                self.restarter
                    .request_restart("configuration changed")
                    .await?;
            }
            // The restart after the install also picks up new configuration.
            UpdateKind::Package | UpdateKind::Both => {
                let version = trigger
                    .new_package_version
                    .as_deref()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or(CoordinatorError::MissingTargetVersion)?;
                self.install(version).await?;
                self.restarter
                    .request_restart(&format!("package updated to {version}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn install(&self, version: &str) -> Result<(), CoordinatorError> {
        let requested = VersionReq::parse(version);

        if let (Some(target), false) = (requested.exact(), self.config.allow_downgrade) {
            if let Some(installed) = self.installed_version().await {
                match compare_versions(target, &installed) {
                    Some(ordering) if ordering.is_lt() => {
                        return Err(CoordinatorError::DowngradeRefused {
                            installed,
                            target: target.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => warn!(
                        installed = %installed,
                        target,
                        "Cannot order versions, skipping downgrade check"
                    ),
                }
            }
        }

        let spec = PackageSpec::new(&self.config.package_name, self.config.extras.clone(), requested);
        info!(spec = %spec, manager = self.packages.name(), "Installing worker package");
        let result = self
            .packages
            .install(&self.config.venv, &spec, self.config.force_reinstall)
            .await;
        self.versions.invalidate(&self.config.package_name);
        result.map_err(CoordinatorError::from)
    }

    async fn installed_version(&self) -> Option<String> {
        let package = &self.config.package_name;
        if let Some(version) = self.versions.get(package) {
            return Some(version);
        }
        match self.packages.installed_version(&self.config.venv, package).await {
            Ok(Some(version)) => {
                self.versions.put(package, &version);
                Some(version)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Could not determine installed package version");
                None
            }
        }
    }

    /// Polls the worker registry until this worker reports active or
    /// `max_wait` elapses.
    pub async fn check_health(
        &self,
        max_wait: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<(), CoordinatorError> {
        let mut shutdown = shutdown.clone();
        let deadline = tokio::time::sleep_until(Instant::now() + max_wait);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.config.health_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.requested() => return Err(CoordinatorError::Cancelled),
                _ = &mut deadline => return Err(CoordinatorError::HealthTimeout(max_wait)),
                _ = ticker.tick() => {}
            }

            match self.registry.list_workers(&self.config.queue_id).await {
                Ok(workers) => {
                    if workers
                        .iter()
                        .any(|w| w.id == self.config.worker_id && w.is_active())
                    {
                        info!(worker_id = %self.config.worker_id, "Worker healthy after update");
                        return Ok(());
                    }
                    debug!(worker_id = %self.config.worker_id, "Worker not active yet");
                }
                Err(e) => debug!(error = %e, "Failed to list workers"),
            }
        }
    }
}

enum Acquisition {
    Acquired(UpdateLock),
    Exhausted {
        attempts: u32,
        holder: Option<WorkerId>,
    },
}

// =============================================================================
// Lock guard
// =============================================================================

/// Releases the update lock when dropped without an explicit release.
struct HeldLock {
    locks: Arc<dyn LockService>,
    queue_id: QueueId,
    holder: WorkerId,
    released: bool,
}

impl HeldLock {
    fn new(locks: Arc<dyn LockService>, queue_id: QueueId, holder: WorkerId) -> Self {
        Self {
            locks,
            queue_id,
            holder,
            released: false,
        }
    }

    async fn release(mut self) {
        release_lock(self.locks.clone(), self.queue_id.clone(), self.holder.clone()).await;
        // Dropped before this point, the guard releases again on drop.
        self.released = true;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let release = release_lock(self.locks.clone(), self.queue_id.clone(), self.holder.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release);
            }
            Err(_) => warn!(
                queue_id = %self.queue_id,
                "No runtime to release update lock, it will expire"
            ),
        }
    }
}

async fn release_lock(locks: Arc<dyn LockService>, queue_id: QueueId, holder: WorkerId) {
    match locks.release(&queue_id, &holder).await {
        Ok(()) => debug!(queue_id = %queue_id, "Released update lock"),
        Err(e) => warn!(queue_id = %queue_id, error = %e, "Failed to release update lock, it will expire"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_control_plane::ControlPlaneError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Lock service whose first release never completes.
    #[derive(Default)]
    struct StallingLocks {
        releases: AtomicU32,
        stalled: Notify,
    }

    #[async_trait]
    impl LockService for StallingLocks {
        async fn acquire(
            &self,
            _queue_id: &QueueId,
            _holder: &WorkerId,
            _duration_seconds: u64,
        ) -> Result<LockOutcome, ControlPlaneError> {
            unreachable!("not used")
        }

        async fn release(&self, _queue_id: &QueueId, _holder: &WorkerId) -> Result<(), ControlPlaneError> {
            if self.releases.fetch_add(1, Ordering::SeqCst) == 0 {
                self.stalled.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn held(locks: &Arc<StallingLocks>) -> HeldLock {
        HeldLock::new(
            locks.clone(),
            QueueId::new("q1").unwrap(),
            WorkerId::new("w1").unwrap(),
        )
    }

    async fn wait_for_releases(locks: &StallingLocks, n: u32) {
        for _ in 0..100 {
            if locks.releases.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} releases");
    }

    #[tokio::test]
    async fn test_cancelled_release_retries_on_drop() {
        let locks = Arc::new(StallingLocks::default());
        let release = tokio::spawn(held(&locks).release());
        locks.stalled.notified().await;

        release.abort();
        assert!(release.await.unwrap_err().is_cancelled());
        wait_for_releases(&locks, 2).await;
    }

    #[tokio::test]
    async fn test_completed_release_is_not_repeated() {
        let locks = Arc::new(StallingLocks::default());
        // Burn the stalling call.
        locks.releases.store(1, Ordering::SeqCst);

        held(&locks).release().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(locks.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let locks = Arc::new(StallingLocks::default());
        locks.releases.store(1, Ordering::SeqCst);

        drop(held(&locks));
        wait_for_releases(&locks, 2).await;
    }
}
