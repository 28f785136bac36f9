//! fleet operator
//!
//! Keeps one worker deployment per active queue. Each pass lists queue
//! configurations from the control plane, lists deployments carrying the
//! managed-by label, and creates, updates or deletes deployments until the
//! two agree.
//!
//! ## Architecture
//!
//! - **Engine**: the control loop, see [`ReconciliationEngine`]
//! - **Template**: renders a queue into a deployment
//! - **Backend**: create/update/delete/list of live deployments, on a
//!   Kubernetes cluster ([`KubernetesBackend`]) or in memory for local runs

pub mod backend;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod template;

pub use backend::{BackendError, DeploymentBackend, InMemoryBackend};
pub use cluster::KubernetesBackend;
pub use config::{BackendKind, Config};
pub use engine::{EngineConfig, ReconcileReport, ReconciliationEngine};
pub use template::DeploymentTemplate;
