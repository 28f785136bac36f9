//! Deployment backend interface and in-memory implementation.
//!
//! The backend owns the live worker deployments. The operator only ever
//! lists deployments matching a label selector and creates, replaces or
//! deletes them by name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_model::{labels, LabelSelector, ManagedDeployment};
use thiserror::Error;
use tracing::{debug, info};

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("deployment {0} already exists")]
    AlreadyExists(String),

    #[error("deployment {0} not found")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Live deployment store.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    async fn list_managed(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedDeployment>, BackendError>;

    async fn create(&self, deployment: &ManagedDeployment) -> Result<(), BackendError>;

    /// Replaces the deployment with the same name.
    async fn update(&self, deployment: &ManagedDeployment) -> Result<(), BackendError>;

    /// Deletes by name. Deleting a missing deployment succeeds.
    async fn delete(&self, name: &str) -> Result<(), BackendError>;
}

/// Operation counts recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
}

impl OpCounts {
    pub fn total(&self) -> u32 {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Debug, Default)]
struct State {
    deployments: BTreeMap<String, ManagedDeployment>,
    failing_queues: BTreeSet<String>,
    fail_listing: bool,
    ops: OpCounts,
}

/// In-memory deployment store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every mutating operation on deployments of `queue_id` fail.
    pub fn fail_queue(&self, queue_id: &str) {
        self.state().failing_queues.insert(queue_id.to_string());
    }

    pub fn heal_queue(&self, queue_id: &str) {
        self.state().failing_queues.remove(queue_id);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Inserts a deployment without counting it as an operation.
    pub fn seed(&self, deployment: ManagedDeployment) {
        self.state()
            .deployments
            .insert(deployment.name.clone(), deployment);
    }

    pub fn get(&self, name: &str) -> Option<ManagedDeployment> {
        self.state().deployments.get(name).cloned()
    }

    /// Deployment serving `queue_id`, if any.
    pub fn for_queue(&self, queue_id: &str) -> Option<ManagedDeployment> {
        self.state()
            .deployments
            .values()
            .find(|d| d.labels.get(labels::QUEUE_ID).map(String::as_str) == Some(queue_id))
            .cloned()
    }

    pub fn deployments(&self) -> Vec<ManagedDeployment> {
        self.state().deployments.values().cloned().collect()
    }

    pub fn ops(&self) -> OpCounts {
        self.state().ops
    }
}

fn check_failing(state: &State, deployment: &ManagedDeployment) -> Result<(), BackendError> {
    let queue = deployment.labels.get(labels::QUEUE_ID);
    if queue.is_some_and(|q| state.failing_queues.contains(q)) {
        return Err(BackendError::Unavailable(format!(
            "injected failure for {}",
            deployment.name
        )));
    }
    Ok(())
}

#[async_trait]
impl DeploymentBackend for InMemoryBackend {
    async fn list_managed(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedDeployment>, BackendError> {
        let state = self.state();
        if state.fail_listing {
            return Err(BackendError::Unavailable("injected listing failure".to_string()));
        }
        Ok(state
            .deployments
            .values()
            .filter(|d| selector.matches(&d.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, deployment: &ManagedDeployment) -> Result<(), BackendError> {
        let mut state = self.state();
        check_failing(&state, deployment)?;
        if state.deployments.contains_key(&deployment.name) {
            return Err(BackendError::AlreadyExists(deployment.name.clone()));
        }
        info!(
            name = %deployment.name,
            replicas = deployment.replicas(),
            "[MEM] Creating deployment"
        );
        state
            .deployments
            .insert(deployment.name.clone(), deployment.clone());
        state.ops.creates += 1;
        Ok(())
    }

    async fn update(&self, deployment: &ManagedDeployment) -> Result<(), BackendError> {
        let mut state = self.state();
        check_failing(&state, deployment)?;
        let Some(existing) = state.deployments.get_mut(&deployment.name) else {
            return Err(BackendError::NotFound(deployment.name.clone()));
        };
        *existing = deployment.clone();
        info!(
            name = %deployment.name,
            replicas = deployment.replicas(),
            "[MEM] Updating deployment"
        );
        state.ops.updates += 1;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if let Some(existing) = state.deployments.get(name) {
            check_failing(&state, existing)?;
        }
        if state.deployments.remove(name).is_some() {
            info!(name, "[MEM] Deleted deployment");
        } else {
            debug!(name, "[MEM] Delete of missing deployment");
        }
        state.ops.deletes += 1;
        Ok(())
    }
}
