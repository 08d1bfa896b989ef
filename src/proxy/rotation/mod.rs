//! Backend rotation strategies
//!
//! A policy picks one backend out of a routing-table snapshot for the next
//! connection. Policies never hold on to the table itself, so the table may be
//! replaced between any two selections.

mod least_conn;
mod random;
mod round_robin;
mod time_based;

pub use least_conn::LeastConnectionsPolicy;
pub use random::RandomPolicy;
pub use round_robin::RoundRobinPolicy;
pub use time_based::TimeBasedPolicy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::models::{Backend, InstanceKey};

/// Strategy types for backend rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    TimeBased,
}

impl RotationStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "least_connections" | "leastconnections" | "least-connections" | "least_conn" => {
                Some(Self::LeastConnections)
            }
            "time_based" | "timebased" | "time-based" => Some(Self::TimeBased),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastConnections => "least_connections",
            Self::TimeBased => "time_based",
        }
    }
}

/// Per-selection inputs besides the table itself
#[derive(Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Client the connection came from
    pub client: Option<SocketAddr>,
    /// Backend that must not be chosen (the one that just failed)
    pub exclude: Option<&'a InstanceKey>,
    /// Live connection counts per backend
    pub tracker: &'a ConnectionTracker,
}

impl<'a> SelectionContext<'a> {
    pub fn new(tracker: &'a ConnectionTracker) -> Self {
        Self {
            client: None,
            exclude: None,
            tracker,
        }
    }

    pub fn client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }

    pub fn exclude(mut self, key: &'a InstanceKey) -> Self {
        self.exclude = Some(key);
        self
    }

    /// Backends of `table` this selection may pick from
    pub fn candidates<'t>(&self, table: &'t [Backend]) -> Vec<&'t Backend> {
        table
            .iter()
            .filter(|b| self.exclude.map_or(true, |key| &b.key != key))
            .collect()
    }
}

/// Strategy selecting the backend for the next connection
///
/// `select` behaves as a function of `(table, context)`: it returns `None`
/// only when the context leaves no eligible backend.
pub trait RotationPolicy: Send + Sync {
    fn select(&self, table: &[Backend], ctx: &SelectionContext<'_>) -> Option<Backend>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Connection tracker for backends
///
/// Counts connections currently relayed through each backend. The
/// orchestrator reads it to decide when a retiring instance has drained and
/// when the whole fleet is idle.
#[derive(Debug)]
pub struct ConnectionTracker {
    connections: DashMap<InstanceKey, usize>,
    last_activity: Mutex<Option<Instant>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            last_activity: Mutex::new(None),
        }
    }

    pub fn acquire(&self, key: InstanceKey) {
        self.connections
            .entry(key)
            .and_modify(|c| *c += 1)
            .or_insert(1);
        *self.last_activity.lock() = Some(Instant::now());
    }

    pub fn release(&self, key: InstanceKey) {
        self.connections.entry(key).and_modify(|c| {
            if *c > 0 {
                *c -= 1;
            }
        });
        self.connections.remove_if(&key, |_, c| *c == 0);
    }

    pub fn get(&self, key: &InstanceKey) -> usize {
        self.connections.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Connections in flight across all backends
    pub fn total(&self) -> usize {
        self.connections.iter().map(|entry| *entry.value()).sum()
    }

    /// Time since a connection was last routed, if one ever was
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity.lock().map(|at| at.elapsed())
    }
}

/// Create a rotation policy for the strategy
pub fn create_policy(strategy: RotationStrategy, interval: Duration) -> Arc<dyn RotationPolicy> {
    match strategy {
        RotationStrategy::RoundRobin => Arc::new(RoundRobinPolicy::new()),
        RotationStrategy::Random => Arc::new(RandomPolicy::new()),
        RotationStrategy::LeastConnections => Arc::new(LeastConnectionsPolicy::new()),
        RotationStrategy::TimeBased => Arc::new(TimeBasedPolicy::with_interval(interval)),
    }
}

#[cfg(test)]
pub(crate) fn test_table(n: usize) -> Vec<Backend> {
    (0..n)
        .map(|i| Backend::new(InstanceKey::new(), format!("127.0.0.1:{}", 8081 + i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_strategy_parse() {
        assert_eq!(
            RotationStrategy::parse("random"),
            Some(RotationStrategy::Random)
        );
        assert_eq!(
            RotationStrategy::parse("round-robin"),
            Some(RotationStrategy::RoundRobin)
        );
        assert_eq!(
            RotationStrategy::parse("least_conn"),
            Some(RotationStrategy::LeastConnections)
        );
        assert_eq!(
            RotationStrategy::parse("TimeBased"),
            Some(RotationStrategy::TimeBased)
        );
        assert_eq!(RotationStrategy::parse("unknown"), None);
    }

    #[test]
    fn test_create_policy_strategy_name() {
        for strategy in [
            RotationStrategy::RoundRobin,
            RotationStrategy::Random,
            RotationStrategy::LeastConnections,
            RotationStrategy::TimeBased,
        ] {
            assert_eq!(
                create_policy(strategy, Duration::from_secs(1)).strategy_name(),
                strategy.as_str()
            );
        }
    }

    #[test]
    fn test_connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        let key = InstanceKey::new();
        let other = InstanceKey::new();

        assert_eq!(tracker.get(&key), 0);
        assert!(tracker.idle_for().is_none());

        tracker.acquire(key);
        tracker.acquire(key);
        tracker.acquire(other);
        assert_eq!(tracker.get(&key), 2);
        assert_eq!(tracker.total(), 3);
        assert!(tracker.idle_for().is_some());

        tracker.release(key);
        assert_eq!(tracker.get(&key), 1);

        tracker.release(key);
        tracker.release(key);
        assert_eq!(tracker.get(&key), 0);
        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn test_every_policy_honours_exclusion() {
        let tracker = ConnectionTracker::new();
        let table = test_table(2);

        for strategy in [
            RotationStrategy::RoundRobin,
            RotationStrategy::Random,
            RotationStrategy::LeastConnections,
            RotationStrategy::TimeBased,
        ] {
            let policy = create_policy(strategy, Duration::from_secs(60));
            let ctx = SelectionContext::new(&tracker).exclude(&table[0].key);
            for _ in 0..10 {
                assert_eq!(policy.select(&table, &ctx).unwrap(), table[1]);
            }

            let lone = vec![table[0].clone()];
            assert!(policy.select(&lone, &ctx).is_none());
            assert!(policy
                .select(&[], &SelectionContext::new(&tracker))
                .is_none());
        }
    }
}
