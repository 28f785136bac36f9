//! # fleet-id
//!
//! Typed identifiers shared by the operator and the worker agent.
//!
//! Identifiers are issued by the control plane and are opaque to this
//! codebase. The only thing the types enforce is that a queue id is never
//! passed where a worker id is expected, and that every id is a non-empty,
//! whitespace-free token that can be placed in a URL path segment, a
//! label value or a file name.
//!
//! ```
//! use fleet_id::{QueueId, WorkerId};
//!
//! let queue: QueueId = "q-7f3a".parse().unwrap();
//! let worker = WorkerId::for_queue(&queue, Some("build-01"));
//! assert_eq!(worker.as_str(), "worker-q-7f3a-build-01");
//! ```

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{validate, MAX_ID_LEN};
pub use types::*;
