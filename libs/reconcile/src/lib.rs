//! Convergence planning for worker deployments.
//!
//! This library turns a snapshot of desired queue state and a listing of
//! live deployments into the set of operations that make them match:
//!
//! - **Desired state**: active [`WorkerQueueConfig`]s from the control plane.
//! - **Current state**: [`ManagedDeployment`]s carrying the managed-by label.
//! - **Plan**: creates, updates and deletes that converge the two.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same inputs
//! - Applying a plan and planning again yields an empty plan
//! - A queue whose configuration could not be fetched is never touched
//! - Every live deployment maps to exactly one active queue, or is deleted

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use fleet_id::QueueId;
use fleet_model::{ManagedDeployment, WorkerQueueConfig};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired-state source could not be listed.
    #[error("failed to list desired state: {0}")]
    DesiredState(String),

    /// The deployment backend could not be listed.
    #[error("failed to list deployments: {0}")]
    Backend(String),

    /// A single queue operation failed.
    #[error("{action} for queue {queue_id} failed: {message}")]
    Operation {
        queue_id: QueueId,
        action: &'static str,
        message: String,
    },
}

/// Why an existing deployment no longer matches its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    ConfigVersion {
        current: Option<String>,
        desired: String,
    },
    Replicas {
        current: u32,
        desired: u32,
    },
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::ConfigVersion { current, desired } => write!(
                f,
                "config version {} -> {}",
                current.as_deref().unwrap_or("<none>"),
                desired
            ),
            Drift::Replicas { current, desired } => {
                write!(f, "replicas {current} -> {desired}")
            }
        }
    }
}

/// Decides whether `current` must be re-rendered from `desired`.
///
/// Compares the config version recorded on the deployment and its replica
/// count against the normalized replica count of the queue. Because the
/// comparison uses state stored on the deployment itself, the decision is
/// the same before and after an operator restart.
pub fn needs_update(current: &ManagedDeployment, desired: &WorkerQueueConfig) -> Option<Drift> {
    if current.config_version() != Some(desired.config_version.as_str()) {
        return Some(Drift::ConfigVersion {
            current: current.config_version().map(str::to_string),
            desired: desired.config_version.clone(),
        });
    }

    let desired_replicas = desired.desired_replicas();
    if current.replicas() != desired_replicas {
        return Some(Drift::Replicas {
            current: current.replicas(),
            desired: desired_replicas,
        });
    }

    None
}

/// An update of an existing deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub queue: WorkerQueueConfig,
    pub current: ManagedDeployment,
    pub drift: Drift,
}

/// Removal of a deployment that no longer maps to an active queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelete {
    pub queue_id: QueueId,
    pub deployment: ManagedDeployment,
    pub reason: DeleteReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// The queue no longer exists in desired state.
    Orphaned,
    /// The queue exists but is not active.
    Inactive,
    /// Another deployment already serves the same queue.
    Duplicate,
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteReason::Orphaned => write!(f, "orphaned"),
            DeleteReason::Inactive => write!(f, "inactive"),
            DeleteReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Operations required to converge one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub creates: Vec<WorkerQueueConfig>,
    pub updates: Vec<PlannedUpdate>,
    pub deletes: Vec<PlannedDelete>,
    /// Active queues whose deployment already matches.
    pub unchanged: usize,
    /// Queues left alone because their configuration is unknown this pass.
    pub protected: Vec<QueueId>,
    /// Deployment names carrying the managed label but no usable queue id.
    pub unlabeled: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

/// Plans the operations that converge `existing` onto `desired`.
///
/// `desired` may contain inactive queues; they count as known but get no
/// deployment. Queues in `unresolved` are treated as unknown: their
/// deployments are neither updated nor deleted.
pub fn plan(
    desired: &[WorkerQueueConfig],
    existing: &[ManagedDeployment],
    unresolved: &BTreeSet<QueueId>,
) -> ReconcilePlan {
    let mut result = ReconcilePlan::default();

    let mut known: HashMap<&QueueId, &WorkerQueueConfig> = HashMap::new();
    for queue in desired {
        known.entry(&queue.queue_id).or_insert(queue);
    }

    // Deterministic order: first deployment by name serves the queue.
    let mut sorted: Vec<&ManagedDeployment> = existing.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut live: BTreeMap<QueueId, &ManagedDeployment> = BTreeMap::new();
    for deployment in sorted {
        let Some(queue_id) = deployment.queue_id() else {
            result.unlabeled.push(deployment.name.clone());
            continue;
        };

        if unresolved.contains(&queue_id) {
            if !result.protected.contains(&queue_id) {
                result.protected.push(queue_id);
            }
            continue;
        }

        match known.get(&queue_id) {
            None => result.deletes.push(PlannedDelete {
                queue_id,
                deployment: deployment.clone(),
                reason: DeleteReason::Orphaned,
            }),
            Some(queue) if !queue.is_active() => result.deletes.push(PlannedDelete {
                queue_id,
                deployment: deployment.clone(),
                reason: DeleteReason::Inactive,
            }),
            Some(_) if live.contains_key(&queue_id) => result.deletes.push(PlannedDelete {
                queue_id,
                deployment: deployment.clone(),
                reason: DeleteReason::Duplicate,
            }),
            Some(_) => {
                live.insert(queue_id, deployment);
            }
        }
    }

    let mut seen = BTreeSet::new();
    for queue in desired {
        // The first entry for a queue id wins, matching `known`.
        if !seen.insert(&queue.queue_id)
            || !queue.is_active()
            || unresolved.contains(&queue.queue_id)
        {
            continue;
        }
        match live.get(&queue.queue_id) {
            None => result.creates.push(queue.clone()),
            Some(current) => match needs_update(current, queue) {
                Some(drift) => result.updates.push(PlannedUpdate {
                    queue: queue.clone(),
                    current: (*current).clone(),
                    drift,
                }),
                None => result.unchanged += 1,
            },
        }
    }

    result
}

/// Tracks repeated failures per queue so persistent errors can be escalated.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    window: Duration,
    failures: BTreeMap<QueueId, (u32, Instant)>,
}

impl FailureTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Records a failure. Returns true once the queue has failed more than
    /// `threshold` times within the window.
    pub fn record_failure(&mut self, queue_id: &QueueId) -> bool {
        let now = Instant::now();
        let (count, first) = self
            .failures
            .entry(queue_id.clone())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.threshold
    }

    /// Number of failures currently counted for a queue.
    pub fn failures(&self, queue_id: &QueueId) -> u32 {
        self.failures.get(queue_id).map_or(0, |(count, _)| *count)
    }

    pub fn clear(&mut self, queue_id: &QueueId) {
        self.failures.remove(queue_id);
    }

    /// Drops entries for queues outside `keep`.
    pub fn retain(&mut self, keep: &BTreeSet<QueueId>) {
        self.failures.retain(|id, _| keep.contains(id));
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Failures per queue before errors are escalated.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Window in which repeated failures are counted.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);
