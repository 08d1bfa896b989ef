//! Time-based backend rotation strategy

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{RotationPolicy, SelectionContext};
use crate::models::{Backend, InstanceKey};

struct Sticky {
    current: Option<InstanceKey>,
    position: usize,
    last_rotation: Instant,
}

/// Sends all traffic to one backend, moving to the next after an interval
///
/// Rotates early when the current backend leaves the table or is excluded.
pub struct TimeBasedPolicy {
    state: Mutex<Sticky>,
    interval: Duration,
}

impl TimeBasedPolicy {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            state: Mutex::new(Sticky {
                current: None,
                position: 0,
                last_rotation: Instant::now(),
            }),
            interval,
        }
    }
}

impl RotationPolicy for TimeBasedPolicy {
    fn select(&self, table: &[Backend], ctx: &SelectionContext<'_>) -> Option<Backend> {
        let candidates = ctx.candidates(table);
        if candidates.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        let still_present = state
            .current
            .and_then(|key| candidates.iter().find(|b| b.key == key))
            .cloned();

        match still_present {
            Some(backend) if now.duration_since(state.last_rotation) < self.interval => {
                Some(backend.clone())
            }
            Some(_) => {
                state.position = (state.position + 1) % candidates.len();
                let next = candidates[state.position];
                state.current = Some(next.key);
                state.last_rotation = now;
                Some(next.clone())
            }
            None => {
                // First selection, or the sticky backend went away.
                if state.current.is_some() {
                    state.position = (state.position + 1) % candidates.len();
                } else {
                    state.position %= candidates.len();
                }
                let next = candidates[state.position];
                state.current = Some(next.key);
                state.last_rotation = now;
                Some(next.clone())
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "time_based"
    }
}
