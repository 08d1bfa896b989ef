//! Published routing table
//!
//! The orchestrator is the only writer. Readers load an `Arc` snapshot and
//! never observe a table that is half updated.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::models::{Backend, InstanceKey};

/// Immutable set of backends eligible for new connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSnapshot {
    /// Bumped on every published change
    pub version: u64,
    pub backends: Vec<Backend>,
}

impl RoutingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.backends.iter().any(|b| &b.key == key)
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.address.as_str()).collect()
    }
}

/// Lock-free holder of the current [`RoutingSnapshot`]
#[derive(Debug)]
pub struct RoutingTable {
    current: ArcSwap<RoutingSnapshot>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingSnapshot::default()),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    /// Atomically replace the table if its membership changed
    ///
    /// Returns `true` when a new snapshot was published.
    pub fn publish(&self, backends: Vec<Backend>) -> bool {
        let current = self.current.load();
        if current.backends == backends {
            return false;
        }
        self.current.store(Arc::new(RoutingSnapshot {
            version: current.version + 1,
            backends,
        }));
        true
    }
}
