use serde::{Deserialize, Serialize};

/// Row counts per status, for status output and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub processing: u64,
    pub dead: u64,
}

impl OutboxCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.dead
    }
}
