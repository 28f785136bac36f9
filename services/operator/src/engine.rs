//! Reconciliation loop for converging worker deployments.
//!
//! Each pass:
//! - Lists queue configurations from the desired-state source
//! - Lists deployments carrying the managed-by label
//! - Creates, updates and deletes deployments until they match
//!
//! A failure on one queue is logged and counted; it never aborts the pass
//! or the loop.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_control_plane::DesiredStateSource;
use fleet_id::QueueId;
use fleet_model::LabelSelector;
use fleet_reconcile::{
    plan, FailureTracker, ReconcileError, DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW,
    DEFAULT_RECONCILE_INTERVAL,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendError, DeploymentBackend};
use crate::template::DeploymentTemplate;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between passes.
    pub reconcile_interval: Duration,

    /// Consecutive failures on a queue before errors are logged at error level.
    pub failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: Vec<QueueId>,
    pub updated: Vec<QueueId>,
    pub deleted: Vec<QueueId>,
    pub failed: Vec<ReconcileError>,
    pub unchanged: usize,
    /// Queues skipped because their configuration could not be fetched.
    pub protected: Vec<QueueId>,
}

impl ReconcileReport {
    /// Returns true if the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.failed.is_empty()
    }

    pub fn changes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Converges managed deployments onto active queues.
pub struct ReconciliationEngine {
    source: Arc<dyn DesiredStateSource>,
    backend: Arc<dyn DeploymentBackend>,
    template: DeploymentTemplate,
    config: EngineConfig,
    failures: Mutex<FailureTracker>,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        backend: Arc<dyn DeploymentBackend>,
        template: DeploymentTemplate,
        config: EngineConfig,
    ) -> Self {
        let failures = FailureTracker::new(config.failure_threshold, DEFAULT_FAILURE_WINDOW);
        Self {
            source,
            backend,
            template,
            config,
            failures: Mutex::new(failures),
        }
    }

    /// Run an initial pass, then one pass per interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Reconciliation pass skipped, will retry");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    ///
    /// Returns an error only if either listing failed, in which case no
    /// operation was attempted.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let snapshot = self
            .source
            .list_queue_configs()
            .await
            .map_err(|e| ReconcileError::DesiredState(e.to_string()))?;

        let existing = self
            .backend
            .list_managed(&LabelSelector::managed())
            .await
            .map_err(|e| ReconcileError::Backend(e.to_string()))?;

        let plan = plan(&snapshot.configs, &existing, &snapshot.unresolved);
        debug!(
            queues = snapshot.configs.len(),
            deployments = existing.len(),
            operations = plan.operation_count(),
            "Planned reconciliation"
        );
        for name in &plan.unlabeled {
            debug!(deployment = %name, "Ignoring managed deployment without queue label");
        }

        let mut report = ReconcileReport {
            unchanged: plan.unchanged,
            protected: plan.protected.clone(),
            ..ReconcileReport::default()
        };

        for queue in &plan.creates {
            let deployment = self.template.render(queue);
            match self.backend.create(&deployment).await {
                Ok(()) => {
                    info!(queue_id = %queue.queue_id, deployment = %deployment.name, "Created worker deployment");
                    report.created.push(queue.queue_id.clone());
                }
                Err(e) => self.record_failure(&mut report, &queue.queue_id, "create", e),
            }
        }

        for update in &plan.updates {
            let mut deployment = self.template.render(&update.queue);
            deployment.name = update.current.name.clone();
            match self.backend.update(&deployment).await {
                Ok(()) => {
                    info!(
                        queue_id = %update.queue.queue_id,
                        deployment = %deployment.name,
                        drift = %update.drift,
                        "Updated worker deployment"
                    );
                    report.updated.push(update.queue.queue_id.clone());
                }
                Err(e) => self.record_failure(&mut report, &update.queue.queue_id, "update", e),
            }
        }

        for delete in &plan.deletes {
            match self.backend.delete(&delete.deployment.name).await {
                Ok(()) => {
                    info!(
                        queue_id = %delete.queue_id,
                        deployment = %delete.deployment.name,
                        reason = %delete.reason,
                        "Deleted worker deployment"
                    );
                    report.deleted.push(delete.queue_id.clone());
                }
                Err(e) => self.record_failure(&mut report, &delete.queue_id, "delete", e),
            }
        }

        self.clear_recovered(&report, &snapshot.configs);

        if report.changes() > 0 || !report.failed.is_empty() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Reconciliation pass complete"
            );
        }

        Ok(report)
    }

    fn record_failure(
        &self,
        report: &mut ReconcileReport,
        queue_id: &QueueId,
        action: &'static str,
        err: BackendError,
    ) {
        let escalate = self
            .failures
            .lock()
            .map(|mut tracker| tracker.record_failure(queue_id))
            .unwrap_or(false);

        if escalate {
            error!(queue_id = %queue_id, action, error = %err, "Worker deployment keeps failing");
        } else {
            warn!(queue_id = %queue_id, action, error = %err, "Worker deployment operation failed");
        }

        report.failed.push(ReconcileError::Operation {
            queue_id: queue_id.clone(),
            action,
            message: err.to_string(),
        });
    }

    fn clear_recovered(&self, report: &ReconcileReport, configs: &[fleet_model::WorkerQueueConfig]) {
        let failed: BTreeSet<&QueueId> = report
            .failed
            .iter()
            .filter_map(|e| match e {
                ReconcileError::Operation { queue_id, .. } => Some(queue_id),
                _ => None,
            })
            .collect();

        if let Ok(mut tracker) = self.failures.lock() {
            let known: BTreeSet<QueueId> = configs.iter().map(|q| q.queue_id.clone()).collect();
            tracker.retain(&known);
            for id in known.iter().filter(|id| !failed.contains(id)) {
                tracker.clear(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use fleet_model::{labels, QueueStatus};
    use fleet_testing::{active_queue, FakeControlPlane};

    struct Harness {
        control_plane: Arc<FakeControlPlane>,
        backend: Arc<InMemoryBackend>,
        engine: ReconciliationEngine,
    }

    fn template() -> DeploymentTemplate {
        DeploymentTemplate {
            image: "worker:test".to_string(),
            control_plane_url: "http://cp".to_string(),
            api_key: "k".to_string(),
            auto_update_interval: None,
        }
    }

    fn engine_for(control_plane: &Arc<FakeControlPlane>, backend: &Arc<InMemoryBackend>) -> ReconciliationEngine {
        ReconciliationEngine::new(
            control_plane.clone(),
            backend.clone(),
            template(),
            EngineConfig::default(),
        )
    }

    fn harness() -> Harness {
        let control_plane = Arc::new(FakeControlPlane::new());
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_for(&control_plane, &backend);
        Harness {
            control_plane,
            backend,
            engine,
        }
    }

    fn qid(id: &str) -> QueueId {
        QueueId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_creates_deployments_for_active_queues() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.control_plane.upsert_queue(active_queue("q2", "v1"));

        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.created.len(), 2);
        assert!(h.backend.for_queue("q1").is_some());
        assert!(h.backend.for_queue("q2").is_some());
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();
        let ops = h.backend.ops();

        let report = h.engine.reconcile().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.backend.ops(), ops);
    }

    #[tokio::test]
    async fn test_fresh_engine_on_converged_state_is_noop() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        // Simulates an operator restart: no in-memory state carries over.
        let restarted = engine_for(&h.control_plane, &h.backend);
        let report = restarted.reconcile().await.unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_config_version_change_updates() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.set_config_version(&qid("q1"), "v2");
        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.updated, vec![qid("q1")]);
        assert_eq!(h.backend.for_queue("q1").unwrap().config_version(), Some("v2"));
    }

    #[tokio::test]
    async fn test_replica_change_updates() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.set_max_workers(&qid("q1"), Some(4));
        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.updated.len(), 1);
        assert_eq!(h.backend.for_queue("q1").unwrap().replicas(), 4);
    }

    #[tokio::test]
    async fn test_inactive_queue_is_removed() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.set_status(&qid("q1"), QueueStatus::Paused);
        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.deleted, vec![qid("q1")]);
        assert!(h.backend.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_cleanup() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.remove_queue(&qid("q1"));
        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.deleted, vec![qid("q1")]);
    }

    #[tokio::test]
    async fn test_unmanaged_deployments_are_left_alone() {
        let h = harness();
        let mut foreign = template().render(&active_queue("other", "v1"));
        foreign.name = "someone-else".to_string();
        foreign.labels.remove(labels::MANAGED_BY);
        h.backend.seed(foreign);

        let report = h.engine.reconcile().await.unwrap();
        assert!(report.is_noop());
        assert!(h.backend.get("someone-else").is_some());
    }

    #[tokio::test]
    async fn test_failure_on_one_queue_does_not_block_others() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.control_plane.upsert_queue(active_queue("q2", "v1"));
        h.backend.fail_queue("q1");

        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.created, vec![qid("q2")]);
        assert_eq!(report.failed.len(), 1);

        h.backend.heal_queue("q1");
        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.created, vec![qid("q1")]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_skips_pass() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.fail_listing(true);
        let err = h.engine.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::DesiredState(_)));
        assert!(h.backend.for_queue("q1").is_some());
        assert_eq!(h.backend.ops().deletes, 0);
    }

    #[tokio::test]
    async fn test_backend_listing_failure_skips_pass() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.backend.fail_listing(true);

        let err = h.engine.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Backend(_)));
        assert_eq!(h.backend.ops().total(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_queue_keeps_deployment() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        h.engine.reconcile().await.unwrap();

        h.control_plane.mark_unresolved(&qid("q1"));
        let report = h.engine.reconcile().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.protected, vec![qid("q1")]);
        assert!(h.backend.for_queue("q1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let h = harness();
        h.control_plane.upsert_queue(active_queue("q1", "v1"));
        let engine = Arc::new(h.engine);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(shutdown_rx).await }
        });

        // Initial pass happens right away.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.backend.for_queue("q1").is_some());

        h.control_plane.upsert_queue(active_queue("q2", "v1"));
        tokio::time::sleep(DEFAULT_RECONCILE_INTERVAL).await;
        assert!(h.backend.for_queue("q2").is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(h.control_plane.calls().list_queue_configs >= 2);
    }
}
