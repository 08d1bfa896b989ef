//! Round-robin backend selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RotationPolicy, SelectionContext};
use crate::models::Backend;

/// Selects backends in round-robin order
///
/// Uses atomic operations for lock-free index tracking. The index is not
/// reset when the table changes: only fairness over time matters, not strict
/// sequencing.
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationPolicy for RoundRobinPolicy {
    fn select(&self, table: &[Backend], ctx: &SelectionContext<'_>) -> Option<Backend> {
        let candidates = ctx.candidates(table);
        if candidates.is_empty() {
            return None;
        }

        // Atomically increment and get the previous value, then wrap around
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).map(|b| (*b).clone())
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
