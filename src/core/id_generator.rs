use std::time::{SystemTime, UNIX_EPOCH};
use parking_lot::Mutex;
use crate::core::types::VectorId;

/// Ids per microsecond before the generator runs ahead of the clock.
const IDS_PER_MICRO: u64 = 1000;

/// Strictly increasing id source shared by all inserting threads.
///
/// Ids are `clock_micros * 1000 + n`; when callers outpace the clock the
/// generator keeps counting from the last id it handed out, so it never goes
/// backwards even if the wall clock does.
pub struct IdGenerator {
    last: Mutex<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator { last: Mutex::new(0) }
    }

    pub fn next_id(&self) -> VectorId {
        self.next_ids(1)[0]
    }

    pub fn next_ids(&self, count: usize) -> Vec<VectorId> {
        if count == 0 {
            return Vec::new();
        }
        let mut last = self.last.lock();
        let base = (*last + 1).max(now_micros().saturating_mul(IDS_PER_MICRO));
        *last = base + count as u64 - 1;
        (base..=*last).collect()
    }

    /// Make sure future ids are greater than `id` (used after WAL replay).
    pub fn advance_past(&self, id: VectorId) {
        let mut last = self.last.lock();
        if *last < id {
            *last = id;
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
