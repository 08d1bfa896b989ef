//! Pool Orchestrator
//!
//! Keeps the fleet within `[min, max]`, replaces unhealthy or expired
//! instances and publishes the routing table.

pub mod backoff;
pub mod orchestrator;
pub mod routing;
pub mod state;

pub use backoff::Backoff;
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSettings, ShutdownReport};
pub use routing::{RoutingSnapshot, RoutingTable};
pub use state::{Action, Event, Pool, PoolCounts, PoolSettings};
