use serde::{Deserialize, Serialize};

/// Snapshot of the pool for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Slots reserved by a cold create still in flight.
    pub creating: usize,
    /// Slots still held by sessions whose destroy has not finished.
    pub destroying: usize,

    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub expired: u64,
    pub invalidated: u64,
}

impl PoolStats {
    pub fn occupied(&self) -> usize {
        self.idle + self.in_use + self.creating + self.destroying
    }
}
