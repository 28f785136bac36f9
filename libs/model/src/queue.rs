//! Desired state of a worker queue.

use std::collections::BTreeMap;

use fleet_id::QueueId;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a queue as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Active,
    Inactive,
    Paused,
    /// Any status this build does not know about. Treated as not active.
    #[serde(other)]
    Unknown,
}

/// Desired configuration of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerQueueConfig {
    pub queue_id: QueueId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: QueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<i32>,
    /// Opaque token that changes whenever the queue settings change.
    #[serde(default)]
    pub config_version: String,
    /// Exact version or version range of the worker package.
    #[serde(
        default,
        alias = "recommended_package_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub package_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl WorkerQueueConfig {
    /// Creates an active queue with the given config version.
    pub fn new(queue_id: QueueId, name: impl Into<String>, config_version: impl Into<String>) -> Self {
        Self {
            queue_id,
            name: name.into(),
            display_name: None,
            status: QueueStatus::Active,
            max_workers: None,
            config_version: config_version.into(),
            package_version: None,
            heartbeat_interval: None,
            environment_name: None,
            tags: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Returns true if the queue should have a running deployment.
    pub fn is_active(&self) -> bool {
        self.status == QueueStatus::Active
    }

    /// Normalized replica count: `max_workers` when positive, else 1.
    pub fn desired_replicas(&self) -> u32 {
        match self.max_workers {
            Some(n) if n > 0 => n as u32,
            _ => 1,
        }
    }

    /// The desired package version, ignoring empty strings.
    pub fn desired_package_version(&self) -> Option<&str> {
        self.package_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}
