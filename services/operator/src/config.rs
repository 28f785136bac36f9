//! Configuration for the operator.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_model::interval::parse_interval;

/// Where worker deployments live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Deployments in a Kubernetes namespace.
    Kubernetes,
    /// A process-local store. Nothing is actually deployed.
    InMemory,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            "memory" | "in-memory" => Ok(BackendKind::InMemory),
            other => anyhow::bail!("unknown backend {other:?}, expected kubernetes or memory"),
        }
    }
}

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane API URL.
    pub control_plane_url: String,

    /// API key used by the operator and handed to worker deployments.
    pub api_key: String,

    /// Namespace deployments are placed in.
    pub namespace: String,

    pub backend: BackendKind,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    /// Default worker image when a queue does not override it.
    pub worker_image: String,

    /// Whether workers are told to apply updates on their own.
    pub enable_auto_update: bool,

    /// How often auto-updating workers poll for changes.
    pub update_check_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("FLEET_API_KEY")
            .filter(|k| !k.is_empty())
            .context("FLEET_API_KEY must be set")?;

        let control_plane_url = lookup("FLEET_CONTROL_PLANE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let namespace = lookup("FLEET_NAMESPACE").unwrap_or_else(|| "fleet-workers".to_string());

        let backend = match lookup("FLEET_BACKEND") {
            Some(raw) => raw.parse().context("invalid FLEET_BACKEND")?,
            None => BackendKind::Kubernetes,
        };

        let reconcile_interval = match lookup("FLEET_RECONCILE_INTERVAL") {
            Some(raw) => parse_interval(&raw)
                .filter(|d| !d.is_zero())
                .with_context(|| format!("invalid FLEET_RECONCILE_INTERVAL: {raw:?}"))?,
            None => fleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
        };

        let worker_image = lookup("FLEET_WORKER_IMAGE")
            .unwrap_or_else(|| "ghcr.io/fleet-rs/worker:latest".to_string());

        let enable_auto_update = lookup("FLEET_ENABLE_AUTO_UPDATE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let update_check_interval = lookup("FLEET_UPDATE_CHECK_INTERVAL")
            .and_then(|raw| parse_interval(&raw))
            .unwrap_or(Duration::from_secs(300));

        Ok(Self {
            control_plane_url,
            api_key,
            namespace,
            backend,
            reconcile_interval,
            worker_image,
            enable_auto_update,
            update_check_interval,
        })
    }
}
