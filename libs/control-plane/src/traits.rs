use std::collections::BTreeSet;

use async_trait::async_trait;
use fleet_id::{QueueId, WorkerId};
use fleet_model::{UpdateLock, WorkerQueueConfig, WorkerRecord};

use crate::ControlPlaneError;

/// One listing of desired state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    /// Configurations that were fetched successfully.
    pub configs: Vec<WorkerQueueConfig>,
    /// Queues known to exist whose configuration could not be fetched.
    pub unresolved: BTreeSet<QueueId>,
}

/// Read-only feed of queue configurations.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Lists every queue. Per-queue fetch failures are reported in
    /// [`QueueSnapshot::unresolved`] rather than failing the whole call.
    async fn list_queue_configs(&self) -> Result<QueueSnapshot, ControlPlaneError>;

    async fn get_queue_config(&self, queue_id: &QueueId)
        -> Result<WorkerQueueConfig, ControlPlaneError>;
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(UpdateLock),
    /// Another holder has a valid lock on the queue.
    Conflict { holder: Option<WorkerId> },
}

/// Cluster-wide exclusive lock keyed by queue.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(
        &self,
        queue_id: &QueueId,
        holder: &WorkerId,
        duration_seconds: u64,
    ) -> Result<LockOutcome, ControlPlaneError>;

    /// Releases the lock if `holder` owns it. Releasing a lock that is not
    /// held is not an error.
    async fn release(&self, queue_id: &QueueId, holder: &WorkerId) -> Result<(), ControlPlaneError>;
}

/// Live worker registry.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn list_workers(&self, queue_id: &QueueId) -> Result<Vec<WorkerRecord>, ControlPlaneError>;
}
