//! Update triggers emitted by the monitor and consumed by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of change was observed. Ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Config,
    Package,
    Both,
}

impl UpdateKind {
    /// The smallest kind covering both `self` and `other`.
    pub fn union(self, other: UpdateKind) -> UpdateKind {
        match (self, other) {
            (a, b) if a == b => a,
            _ => UpdateKind::Both,
        }
    }

    pub fn includes_config(self) -> bool {
        matches!(self, UpdateKind::Config | UpdateKind::Both)
    }

    pub fn includes_package(self) -> bool {
        matches!(self, UpdateKind::Package | UpdateKind::Both)
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateKind::Config => write!(f, "config"),
            UpdateKind::Package => write!(f, "package"),
            UpdateKind::Both => write!(f, "config+package"),
        }
    }
}

/// An observed change in desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTrigger {
    pub kind: UpdateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_config_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_package_version: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl UpdateTrigger {
    pub fn config(version: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Config,
            new_config_version: Some(version.into()),
            new_package_version: None,
            detected_at: Utc::now(),
        }
    }

    pub fn package(version: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Package,
            new_config_version: None,
            new_package_version: Some(version.into()),
            detected_at: Utc::now(),
        }
    }

    pub fn both(config_version: impl Into<String>, package_version: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Both,
            new_config_version: Some(config_version.into()),
            new_package_version: Some(package_version.into()),
            detected_at: Utc::now(),
        }
    }

    /// Folds a newer trigger into this pending one.
    ///
    /// The result covers both kinds and carries the newest version of each
    /// dimension, so a consumer that only sees the merged trigger applies
    /// every change that was observed.
    #[must_use]
    pub fn merge(self, newer: UpdateTrigger) -> UpdateTrigger {
        UpdateTrigger {
            kind: self.kind.union(newer.kind),
            new_config_version: newer.new_config_version.or(self.new_config_version),
            new_package_version: newer.new_package_version.or(self.new_package_version),
            detected_at: newer.detected_at,
        }
    }
}
