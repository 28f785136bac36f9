//! Per-queue update lock.

use chrono::{DateTime, Utc};
use fleet_id::{LockId, QueueId, WorkerId};
use serde::{Deserialize, Serialize};

/// A granted update lock. At most one is valid per queue at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLock {
    pub lock_id: LockId,
    pub queue_id: QueueId,
    #[serde(rename = "worker_id")]
    pub holder_id: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UpdateLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Seconds the lock was granted for.
    pub fn duration_seconds(&self) -> i64 {
        (self.expires_at - self.acquired_at).num_seconds()
    }
}
