//! Least-connections backend selection strategy

use super::{RotationPolicy, SelectionContext};
use crate::models::Backend;

/// Selects the backend with the fewest active connections
///
/// Ties go to the backend listed first in the table.
pub struct LeastConnectionsPolicy;

impl LeastConnectionsPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastConnectionsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationPolicy for LeastConnectionsPolicy {
    fn select(&self, table: &[Backend], ctx: &SelectionContext<'_>) -> Option<Backend> {
        let mut min_connections = usize::MAX;
        let mut selected: Option<&Backend> = None;

        for backend in ctx.candidates(table) {
            let connections = ctx.tracker.get(&backend.key);
            if connections < min_connections {
                min_connections = connections;
                selected = Some(backend);
            }
        }

        selected.cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "least_connections"
    }
}
