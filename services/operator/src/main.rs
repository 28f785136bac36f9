//! fleet operator
//!
//! Watches worker queues on the control plane and keeps exactly one worker
//! deployment per active queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_control_plane::{HttpConfig, HttpControlPlane};
use fleet_operator::{
    BackendKind, Config, DeploymentBackend, DeploymentTemplate, EngineConfig, InMemoryBackend,
    KubernetesBackend, ReconciliationEngine,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG`, then `FLEET_LOG_LEVEL`, then `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("FLEET_LOG_LEVEL")
                .map_err(|_| ())
                .and_then(|level| EnvFilter::try_new(level).map_err(|_| ()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Upper bound on how long shutdown waits for the loop to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet operator");

    let config = Config::from_env()?;
    info!(
        control_plane_url = %config.control_plane_url,
        namespace = %config.namespace,
        backend = ?config.backend,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        auto_update = config.enable_auto_update,
        "Configuration loaded"
    );

    let control_plane = HttpControlPlane::new(HttpConfig::new(
        config.control_plane_url.clone(),
        config.api_key.clone(),
    ))
    .context("failed to build control plane client")?;

    let backend: Arc<dyn DeploymentBackend> = match config.backend {
        BackendKind::Kubernetes => Arc::new(
            KubernetesBackend::connect(&config.namespace)
                .await
                .context("failed to connect to Kubernetes")?,
        ),
        BackendKind::InMemory => {
            warn!("Using the in-memory backend, no workers will be deployed");
            Arc::new(InMemoryBackend::new())
        }
    };

    let engine = ReconciliationEngine::new(
        Arc::new(control_plane),
        backend,
        DeploymentTemplate::from_config(&config),
        EngineConfig {
            reconcile_interval: config.reconcile_interval,
            ..EngineConfig::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut engine_handle => {
            match result {
                Ok(()) => warn!("Reconciler exited unexpectedly"),
                Err(e) => error!(error = %e, "Reconciler task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, engine_handle).await {
        Ok(_) => info!("Operator shutdown complete"),
        Err(_) => warn!("Reconciler did not stop within the grace period"),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
