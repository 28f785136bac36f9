//! # fleet-control-plane
//!
//! Narrow interfaces to the remote control plane, plus the HTTP client that
//! implements them.
//!
//! The operator and the worker agent never talk to the REST API directly;
//! they hold one of the traits below so tests can substitute an in-memory
//! fake:
//!
//! - [`DesiredStateSource`]: read-only feed of queue configurations
//! - [`LockService`]: per-queue update lock with TTL and owner identity
//! - [`WorkerRegistry`]: live worker status, used for post-update health

mod error;
mod http;
mod traits;

pub use error::ControlPlaneError;
pub use http::{HttpConfig, HttpControlPlane, LockStatus};
pub use traits::{DesiredStateSource, LockOutcome, LockService, QueueSnapshot, WorkerRegistry};
