//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Control plane resources
// =============================================================================

define_id!(QueueId, "queue id");
define_id!(WorkerId, "worker id");
define_id!(LockId, "lock id");

impl WorkerId {
    /// Derives the identity a worker registers under for `queue`.
    ///
    /// The hostname suffix keeps replicas of the same queue on different
    /// hosts distinguishable to the lock service and the worker registry.
    #[must_use]
    pub fn for_queue(queue: &QueueId, hostname: Option<&str>) -> Self {
        let mut id = format!("worker-{}", queue.as_str());
        if let Some(host) = hostname {
            let host: String = host
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
                .collect();
            let host = host.trim_matches('-');
            if !host.is_empty() {
                id.push('-');
                id.push_str(host);
            }
        }
        if id.len() > crate::MAX_ID_LEN {
            let mut end = crate::MAX_ID_LEN;
            while !id.is_char_boundary(end) {
                end -= 1;
            }
            id.truncate(end);
        }
        Self(id)
    }
}

impl LockId {
    /// Generates a fresh time-ordered lock id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("lock-{}", uuid::Uuid::now_v7()))
    }
}

// =============================================================================
// Tests
// =============================================================================
