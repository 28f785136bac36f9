//! Renders a queue configuration into a worker deployment.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_id::QueueId;
use fleet_model::interval::format_interval;
use fleet_model::{labels, ManagedDeployment, ReplicaSpec, WorkerQueueConfig};

use crate::config::Config;

/// Maximum length of a DNS-1123 label.
const MAX_NAME_LEN: usize = 63;

/// Environment keys owned by the operator. Queue settings cannot override them.
const RESERVED_ENV: &[&str] = &[
    "FLEET_QUEUE_ID",
    "FLEET_API_KEY",
    "FLEET_CONTROL_PLANE_URL",
    "FLEET_WORKER_AUTOUPDATE",
    "FLEET_WORKER_UPDATE_CHECK_INTERVAL",
];

/// Deployment rendering settings.
#[derive(Debug, Clone)]
pub struct DeploymentTemplate {
    pub image: String,
    pub control_plane_url: String,
    pub api_key: String,
    /// When set, workers poll for updates at this interval.
    pub auto_update_interval: Option<Duration>,
}

impl DeploymentTemplate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.worker_image.clone(),
            control_plane_url: config.control_plane_url.clone(),
            api_key: config.api_key.clone(),
            auto_update_interval: config
                .enable_auto_update
                .then_some(config.update_check_interval),
        }
    }

    /// Renders the deployment for `queue`.
    ///
    /// Queue settings may carry `image` (string) and `env` (object of
    /// strings) overrides.
    pub fn render(&self, queue: &WorkerQueueConfig) -> ManagedDeployment {
        let mut label_map = BTreeMap::new();
        label_map.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
        label_map.insert(labels::COMPONENT.to_string(), "worker".to_string());
        label_map.insert(labels::QUEUE_ID.to_string(), queue.queue_id.to_string());
        label_map.insert(labels::QUEUE_NAME.to_string(), label_value(&queue.name));
        if let Some(env) = &queue.environment_name {
            label_map.insert(labels::ENVIRONMENT.to_string(), label_value(env));
        }
        for tag in &queue.tags {
            label_map.insert(format!("{}{}", labels::TAG_PREFIX, label_value(tag)), "true".to_string());
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(
            labels::CONFIG_VERSION_ANNOTATION.to_string(),
            queue.config_version.clone(),
        );
        annotations.insert(
            labels::PACKAGE_VERSION_ANNOTATION.to_string(),
            queue.desired_package_version().unwrap_or("latest").to_string(),
        );

        let mut env = BTreeMap::new();
        if let Some(extra) = queue.settings.get("env").and_then(|v| v.as_object()) {
            for (key, value) in extra {
                if RESERVED_ENV.contains(&key.as_str()) {
                    continue;
                }
                if let Some(value) = value.as_str() {
                    env.insert(key.clone(), value.to_string());
                }
            }
        }
        env.insert("FLEET_QUEUE_ID".to_string(), queue.queue_id.to_string());
        env.insert("FLEET_API_KEY".to_string(), self.api_key.clone());
        env.insert("FLEET_CONTROL_PLANE_URL".to_string(), self.control_plane_url.clone());
        if let Some(interval) = self.auto_update_interval {
            env.insert("FLEET_WORKER_AUTOUPDATE".to_string(), "true".to_string());
            env.insert(
                "FLEET_WORKER_UPDATE_CHECK_INTERVAL".to_string(),
                format_interval(interval),
            );
        }

        let image = queue
            .settings
            .get("image")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.image)
            .to_string();

        ManagedDeployment {
            name: deployment_name(&queue.name, &queue.queue_id),
            labels: label_map,
            annotations,
            replica_spec: ReplicaSpec {
                replicas: queue.desired_replicas(),
                image,
                env,
            },
        }
    }
}

/// Length of the queue id suffix that keeps names unique.
const ID_SUFFIX_LEN: usize = 8;

/// `fleet-worker-<name>-<id prefix>` reduced to a DNS-1123 label.
///
/// Queue names are not unique, so the suffix carries the start of the queue
/// id and survives truncation of long names.
pub fn deployment_name(queue_name: &str, queue_id: &QueueId) -> String {
    let mut suffix = dns_segment(queue_id.as_str());
    suffix.truncate(ID_SUFFIX_LEN);
    let suffix = suffix.trim_end_matches('-');

    let mut name = format!("fleet-worker-{}", dns_segment(queue_name));
    let budget = if suffix.is_empty() {
        MAX_NAME_LEN
    } else {
        MAX_NAME_LEN - suffix.len() - 1
    };
    name.truncate(budget);
    let mut name = name.trim_end_matches('-').to_string();
    if !suffix.is_empty() {
        name.push('-');
        name.push_str(suffix);
    }
    name
}

/// Lowercase alphanumerics with runs of anything else collapsed to one `-`.
fn dns_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out
}

/// Label values are limited to 63 alphanumerics, `-`, `_` and `.`.
fn label_value(raw: &str) -> String {
    let mut value: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect();
    value.truncate(MAX_NAME_LEN);
    value.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}
