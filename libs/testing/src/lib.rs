//! In-memory fakes of the control plane collaborators.
//!
//! [`FakeControlPlane`] implements [`DesiredStateSource`], [`LockService`]
//! and [`WorkerRegistry`] over shared state, so one instance can play the
//! remote control plane for an operator and several workers at once. Lock
//! expiry follows `tokio::time`, which makes it usable under paused time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_control_plane::{
    ControlPlaneError, DesiredStateSource, LockOutcome, LockService, QueueSnapshot,
    WorkerRegistry,
};
use fleet_id::{LockId, QueueId, WorkerId};
use fleet_model::{QueueStatus, UpdateLock, WorkerQueueConfig, WorkerRecord, WorkerStatus};
use tokio::time::Instant;
use tracing::debug;

/// Number of calls made to each collaborator operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list_queue_configs: u32,
    pub get_queue_config: u32,
    pub acquire: u32,
    pub release: u32,
    pub list_workers: u32,
}

#[derive(Debug)]
struct HeldLock {
    lock: UpdateLock,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    queues: BTreeMap<QueueId, WorkerQueueConfig>,
    unresolved: BTreeSet<QueueId>,
    fail_listing: bool,
    failing_gets: u32,
    failing_acquires: u32,
    locks: HashMap<QueueId, HeldLock>,
    grants: Vec<UpdateLock>,
    releases: Vec<(QueueId, WorkerId)>,
    workers: HashMap<QueueId, BTreeMap<WorkerId, WorkerRecord>>,
    calls: CallCounts,
}

/// Shared in-memory control plane.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    state: Mutex<State>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Desired state
    // =========================================================================

    /// Inserts or replaces a queue configuration.
    pub fn upsert_queue(&self, config: WorkerQueueConfig) {
        self.state().queues.insert(config.queue_id.clone(), config);
    }

    pub fn remove_queue(&self, queue_id: &QueueId) {
        self.state().queues.remove(queue_id);
    }

    pub fn set_status(&self, queue_id: &QueueId, status: QueueStatus) {
        if let Some(q) = self.state().queues.get_mut(queue_id) {
            q.status = status;
        }
    }

    pub fn set_config_version(&self, queue_id: &QueueId, version: &str) {
        if let Some(q) = self.state().queues.get_mut(queue_id) {
            q.config_version = version.to_string();
        }
    }

    pub fn set_package_version(&self, queue_id: &QueueId, version: Option<&str>) {
        if let Some(q) = self.state().queues.get_mut(queue_id) {
            q.package_version = version.map(str::to_string);
        }
    }

    pub fn set_max_workers(&self, queue_id: &QueueId, max_workers: Option<i32>) {
        if let Some(q) = self.state().queues.get_mut(queue_id) {
            q.max_workers = max_workers;
        }
    }

    pub fn queue(&self, queue_id: &QueueId) -> Option<WorkerQueueConfig> {
        self.state().queues.get(queue_id).cloned()
    }

    /// Makes per-queue fetches of `queue_id` fail during listings.
    pub fn mark_unresolved(&self, queue_id: &QueueId) {
        self.state().unresolved.insert(queue_id.clone());
    }

    pub fn clear_unresolved(&self, queue_id: &QueueId) {
        self.state().unresolved.remove(queue_id);
    }

    /// Makes every listing fail until cleared.
    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Makes the next `n` single-queue fetches fail.
    pub fn fail_next_gets(&self, n: u32) {
        self.state().failing_gets = n;
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Makes the next `n` acquisitions fail with a transport error.
    pub fn fail_next_acquires(&self, n: u32) {
        self.state().failing_acquires = n;
    }

    /// Grants a lock to `holder` directly, as if another worker held it.
    pub fn hold_lock(&self, queue_id: &QueueId, holder: &WorkerId, duration: Duration) {
        let mut state = self.state();
        let lock = new_lock(queue_id, holder, duration);
        state.locks.insert(
            queue_id.clone(),
            HeldLock {
                lock,
                deadline: Instant::now() + duration,
            },
        );
    }

    /// Current valid holder of the queue's lock.
    pub fn lock_holder(&self, queue_id: &QueueId) -> Option<WorkerId> {
        let mut state = self.state();
        expire(&mut state, queue_id);
        state.locks.get(queue_id).map(|l| l.lock.holder_id.clone())
    }

    /// Every lock granted through [`LockService::acquire`], in order.
    pub fn grants(&self) -> Vec<UpdateLock> {
        self.state().grants.clone()
    }

    /// Every release call, in order.
    pub fn releases(&self) -> Vec<(QueueId, WorkerId)> {
        self.state().releases.clone()
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    pub fn set_worker_status(&self, queue_id: &QueueId, worker_id: &WorkerId, status: WorkerStatus) {
        let record = WorkerRecord {
            id: worker_id.clone(),
            queue_id: Some(queue_id.clone()),
            status,
            last_seen: Some(Utc::now()),
        };
        self.state()
            .workers
            .entry(queue_id.clone())
            .or_default()
            .insert(worker_id.clone(), record);
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }
}

fn new_lock(queue_id: &QueueId, holder: &WorkerId, duration: Duration) -> UpdateLock {
    let acquired_at = Utc::now();
    let ttl = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365));
    UpdateLock {
        lock_id: LockId::generate(),
        queue_id: queue_id.clone(),
        holder_id: holder.clone(),
        acquired_at,
        expires_at: acquired_at + ttl,
    }
}

fn expire(state: &mut State, queue_id: &QueueId) {
    if let Some(held) = state.locks.get(queue_id) {
        if Instant::now() >= held.deadline {
            debug!(queue_id = %queue_id, holder = %held.lock.holder_id, "[FAKE] lock expired");
            state.locks.remove(queue_id);
        }
    }
}

fn injected(what: &str) -> ControlPlaneError {
    ControlPlaneError::Transport(format!("injected failure: {what}"))
}

#[async_trait]
impl DesiredStateSource for FakeControlPlane {
    async fn list_queue_configs(&self) -> Result<QueueSnapshot, ControlPlaneError> {
        let mut state = self.state();
        state.calls.list_queue_configs += 1;
        if state.fail_listing {
            return Err(injected("list queues"));
        }

        let mut snapshot = QueueSnapshot::default();
        for (id, config) in &state.queues {
            if state.unresolved.contains(id) {
                snapshot.unresolved.insert(id.clone());
            } else {
                snapshot.configs.push(config.clone());
            }
        }
        Ok(snapshot)
    }

    async fn get_queue_config(
        &self,
        queue_id: &QueueId,
    ) -> Result<WorkerQueueConfig, ControlPlaneError> {
        let mut state = self.state();
        state.calls.get_queue_config += 1;
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(injected("get queue config"));
        }
        state
            .queues
            .get(queue_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(queue_id.to_string()))
    }
}

#[async_trait]
impl LockService for FakeControlPlane {
    async fn acquire(
        &self,
        queue_id: &QueueId,
        holder: &WorkerId,
        duration_seconds: u64,
    ) -> Result<LockOutcome, ControlPlaneError> {
        let mut state = self.state();
        state.calls.acquire += 1;
        if state.failing_acquires > 0 {
            state.failing_acquires -= 1;
            return Err(injected("acquire"));
        }

        expire(&mut state, queue_id);
        if let Some(held) = state.locks.get(queue_id) {
            if &held.lock.holder_id != holder {
                return Ok(LockOutcome::Conflict {
                    holder: Some(held.lock.holder_id.clone()),
                });
            }
        }

        let duration = Duration::from_secs(duration_seconds);
        let lock = new_lock(queue_id, holder, duration);
        debug!(queue_id = %queue_id, holder = %holder, "[FAKE] lock granted");
        state.locks.insert(
            queue_id.clone(),
            HeldLock {
                lock: lock.clone(),
                deadline: Instant::now() + duration,
            },
        );
        state.grants.push(lock.clone());
        Ok(LockOutcome::Acquired(lock))
    }

    async fn release(&self, queue_id: &QueueId, holder: &WorkerId) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.calls.release += 1;
        state.releases.push((queue_id.clone(), holder.clone()));

        let owned = state
            .locks
            .get(queue_id)
            .is_some_and(|held| &held.lock.holder_id == holder);
        if owned {
            state.locks.remove(queue_id);
            debug!(queue_id = %queue_id, holder = %holder, "[FAKE] lock released");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for FakeControlPlane {
    async fn list_workers(&self, queue_id: &QueueId) -> Result<Vec<WorkerRecord>, ControlPlaneError> {
        let mut state = self.state();
        state.calls.list_workers += 1;
        Ok(state
            .workers
            .get(queue_id)
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Builds an active queue config for tests.
pub fn active_queue(id: &str, config_version: &str) -> WorkerQueueConfig {
    let queue_id = QueueId::new(id).unwrap_or_else(|e| panic!("invalid test queue id {id:?}: {e}"));
    WorkerQueueConfig::new(queue_id, id, config_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids() -> (QueueId, WorkerId, WorkerId) {
        (
            QueueId::new("q1").unwrap(),
            WorkerId::new("worker-a").unwrap(),
            WorkerId::new("worker-b").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let fake = FakeControlPlane::new();
        let (q, a, b) = ids();

        assert!(matches!(fake.acquire(&q, &a, 60).await.unwrap(), LockOutcome::Acquired(_)));
        assert_eq!(
            fake.acquire(&q, &b, 60).await.unwrap(),
            LockOutcome::Conflict { holder: Some(a.clone()) }
        );

        // Only the holder can release.
        fake.release(&q, &b).await.unwrap();
        assert_eq!(fake.lock_holder(&q), Some(a.clone()));

        fake.release(&q, &a).await.unwrap();
        assert!(matches!(fake.acquire(&q, &b, 60).await.unwrap(), LockOutcome::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let fake = FakeControlPlane::new();
        let (q, a, b) = ids();

        fake.acquire(&q, &a, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(fake.acquire(&q, &b, 10).await.unwrap(), LockOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_one() {
        let fake = Arc::new(FakeControlPlane::new());
        let q = QueueId::new("q1").unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let fake = fake.clone();
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let worker = WorkerId::new(format!("worker-{i}")).unwrap();
                fake.acquire(&q, &worker, 60).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), LockOutcome::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(fake.grants().len(), 1);
    }

    #[tokio::test]
    async fn test_listing_reports_unresolved() {
        let fake = FakeControlPlane::new();
        fake.upsert_queue(active_queue("q1", "v1"));
        fake.upsert_queue(active_queue("q2", "v1"));
        fake.mark_unresolved(&QueueId::new("q2").unwrap());

        let snapshot = fake.list_queue_configs().await.unwrap();
        assert_eq!(snapshot.configs.len(), 1);
        assert_eq!(snapshot.unresolved.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let fake = FakeControlPlane::new();
        let (q, a, _) = ids();
        fake.upsert_queue(active_queue("q1", "v1"));
        fake.fail_next_gets(1);
        fake.fail_next_acquires(1);

        assert!(fake.get_queue_config(&q).await.is_err());
        assert!(fake.get_queue_config(&q).await.is_ok());
        assert!(fake.acquire(&q, &a, 60).await.is_err());
        assert!(fake.acquire(&q, &a, 60).await.is_ok());
        assert_eq!(fake.calls().acquire, 2);
    }
}
