//! # fleet-model
//!
//! Data contracts shared by the reconciliation operator and the worker agent.
//!
//! - [`WorkerQueueConfig`]: desired state of one queue, polled from the
//!   control plane and never mutated here
//! - [`ManagedDeployment`]: a live worker deployment carrying the managed-by
//!   and queue-id labels
//! - [`UpdateLock`]: the per-queue mutual exclusion token
//! - [`UpdateTrigger`]: an observed configuration or package change
//! - [`DaemonInfo`]: the PID file contents of a supervised local worker

mod daemon;
mod deployment;
pub mod interval;
pub mod labels;
mod lock;
mod queue;
mod trigger;
mod worker;

pub use daemon::{DaemonInfo, DeploymentType};
pub use deployment::{LabelSelector, ManagedDeployment, ReplicaSpec};
pub use lock::UpdateLock;
pub use queue::{QueueStatus, WorkerQueueConfig};
pub use trigger::{UpdateKind, UpdateTrigger};
pub use worker::{WorkerRecord, WorkerStatus};
