//! Random backend selection strategy

use rand::seq::SliceRandom;

use super::{RotationPolicy, SelectionContext};
use crate::models::Backend;

/// Selects a random backend from the table
pub struct RandomPolicy;

impl RandomPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationPolicy for RandomPolicy {
    fn select(&self, table: &[Backend], ctx: &SelectionContext<'_>) -> Option<Backend> {
        let candidates = ctx.candidates(table);
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).map(|b| (*b).clone())
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
