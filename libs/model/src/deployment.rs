//! Live worker deployments under fleet management.

use std::collections::BTreeMap;
use std::fmt;

use fleet_id::QueueId;
use serde::{Deserialize, Serialize};

use crate::labels;

/// Replica count, image and environment of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub replicas: u32,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A worker deployment owned by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDeployment {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub replica_spec: ReplicaSpec,
}

impl ManagedDeployment {
    /// Returns true if the managed-by marker is present.
    pub fn is_managed(&self) -> bool {
        self.labels.get(labels::MANAGED_BY).map(String::as_str) == Some(labels::MANAGED_BY_VALUE)
    }

    /// The queue this deployment serves, if the label is present and valid.
    pub fn queue_id(&self) -> Option<QueueId> {
        self.labels
            .get(labels::QUEUE_ID)
            .and_then(|v| QueueId::new(v.as_str()).ok())
    }

    /// Config version recorded when the deployment was last rendered.
    pub fn config_version(&self) -> Option<&str> {
        self.annotations
            .get(labels::CONFIG_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    /// Package version recorded when the deployment was last rendered.
    pub fn package_version(&self) -> Option<&str> {
        self.annotations
            .get(labels::PACKAGE_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn replicas(&self) -> u32 {
        self.replica_spec.replicas
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selects every deployment carrying the managed-by marker.
    pub fn managed() -> Self {
        Self::default().with(labels::MANAGED_BY, labels::MANAGED_BY_VALUE)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if every selector term is present in `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.match_labels {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(queue: &str) -> ManagedDeployment {
        let mut label_map = BTreeMap::new();
        label_map.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
        label_map.insert(labels::QUEUE_ID.to_string(), queue.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(labels::CONFIG_VERSION_ANNOTATION.to_string(), "v3".to_string());
        ManagedDeployment {
            name: format!("fleet-worker-{queue}"),
            labels: label_map,
            annotations,
            replica_spec: ReplicaSpec {
                replicas: 2,
                image: "worker:latest".to_string(),
                env: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_accessors() {
        let d = deployment("q1");
        assert!(d.is_managed());
        assert_eq!(d.queue_id().unwrap().as_str(), "q1");
        assert_eq!(d.config_version(), Some("v3"));
        assert_eq!(d.package_version(), None);
        assert_eq!(d.replicas(), 2);
    }

    #[test]
    fn test_managed_selector() {
        let selector = LabelSelector::managed();
        assert!(selector.matches(&deployment("q1").labels));
        assert!(!selector.matches(&BTreeMap::new()));
        assert_eq!(
            selector.to_string(),
            "app.kubernetes.io/managed-by=fleet-operator"
        );
    }

    #[test]
    fn test_selector_display_joins_terms() {
        let selector = LabelSelector::default().with("a", "1").with("b", "2");
        assert_eq!(selector.to_string(), "a=1,b=2");
    }

    #[test]
    fn test_invalid_queue_label() {
        let mut d = deployment("q1");
        d.labels.insert(labels::QUEUE_ID.to_string(), String::new());
        assert!(d.queue_id().is_none());
    }
}
