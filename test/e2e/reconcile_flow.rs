//! Operator lifecycle of one queue: created, reconfigured, removed.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test reconcile_flow
//! ```

use std::sync::Arc;

use fleet_id::QueueId;
use fleet_model::labels;
use fleet_operator::{DeploymentTemplate, EngineConfig, InMemoryBackend, ReconciliationEngine};
use fleet_testing::{active_queue, FakeControlPlane};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fleet_operator=debug")
        .with_test_writer()
        .try_init();
}

fn template() -> DeploymentTemplate {
    DeploymentTemplate {
        image: "worker:e2e".to_string(),
        control_plane_url: "http://control-plane".to_string(),
        api_key: "e2e-key".to_string(),
        auto_update_interval: None,
    }
}

#[tokio::test]
async fn test_queue_lifecycle() {
    init_tracing();

    let control_plane = Arc::new(FakeControlPlane::new());
    let backend = Arc::new(InMemoryBackend::new());
    let engine = ReconciliationEngine::new(
        control_plane.clone(),
        backend.clone(),
        template(),
        EngineConfig::default(),
    );
    let q1 = QueueId::new("q1").unwrap();

    // Added: exactly one deployment labelled with the queue.
    control_plane.upsert_queue(active_queue("q1", "v1"));
    control_plane.set_max_workers(&q1, Some(1));
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.created, vec![q1.clone()]);

    let deployments = backend.deployments();
    assert_eq!(deployments.len(), 1);
    let first = &deployments[0];
    assert_eq!(first.labels.get(labels::QUEUE_ID).map(String::as_str), Some("q1"));
    assert_eq!(first.replicas(), 1);
    assert_eq!(first.config_version(), Some("v1"));

    // Reconfigured: updated in place, not recreated.
    control_plane.set_config_version(&q1, "v2");
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.updated, vec![q1.clone()]);
    assert!(report.created.is_empty());
    assert!(report.deleted.is_empty());

    let deployments = backend.deployments();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].name, first.name);
    assert_eq!(deployments[0].config_version(), Some("v2"));
    assert_eq!(backend.ops().creates, 1);
    assert_eq!(backend.ops().updates, 1);

    // Converged: another pass does nothing.
    assert!(engine.reconcile().await.unwrap().is_noop());

    // Removed: the deployment goes away.
    control_plane.remove_queue(&q1);
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.deleted, vec![q1.clone()]);
    assert!(backend.for_queue("q1").is_none());
    assert!(backend.deployments().is_empty());
}

#[tokio::test]
async fn test_control_plane_outage_changes_nothing() {
    init_tracing();

    let control_plane = Arc::new(FakeControlPlane::new());
    let backend = Arc::new(InMemoryBackend::new());
    let engine = ReconciliationEngine::new(
        control_plane.clone(),
        backend.clone(),
        template(),
        EngineConfig::default(),
    );

    control_plane.upsert_queue(active_queue("q1", "v1"));
    engine.reconcile().await.unwrap();

    control_plane.fail_listing(true);
    control_plane.remove_queue(&QueueId::new("q1").unwrap());
    assert!(engine.reconcile().await.is_err());
    assert!(backend.for_queue("q1").is_some());

    control_plane.fail_listing(false);
    engine.reconcile().await.unwrap();
    assert!(backend.for_queue("q1").is_none());
}
