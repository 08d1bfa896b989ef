//! Exponential backoff for failing provider calls

use std::time::{Duration, Instant};

/// Tracks consecutive failures of one kind of call and when it may run again
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    next_allowed: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            next_allowed: None,
        }
    }

    /// Delay after the `failures`-th consecutive failure
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_allowed.map_or(true, |at| now >= at)
    }

    /// Record a failure, returning how long the caller must now wait
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay_for(self.failures);
        self.next_allowed = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_allowed = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
