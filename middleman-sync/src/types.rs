use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of mirroring one call to the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "id", rename_all = "snake_case")]
pub enum Delivery {
    /// The authority accepted the call.
    Delivered,
    /// The authority answered 404; the target is already gone upstream.
    AlreadyAbsent,
    /// The call failed and was written to the outbox under this id.
    Queued(Uuid),
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub loaded: usize,
    pub delivered: usize,
    pub retried: usize,
    pub archived: usize,
    /// Records whose new state could not be written; they stay pending.
    pub failed_io: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.loaded == 0
    }
}

/// Snapshot of the outbox for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxStatus {
    pub pending: usize,
    pub archived: usize,
    pub draining: bool,
    pub max_retries: u32,
    pub interval_secs: u64,
}
