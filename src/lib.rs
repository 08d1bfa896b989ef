//! Proxyfleet - Rotating proxy over an on-demand cloud fleet
//!
//! Clients talk to one stable HTTP/HTTPS proxy endpoint; every connection is
//! relayed through one of a pool of cloud instances running forward proxies.
//!
//! ## Features
//!
//! - Pool orchestration within `[min, max]`, with replacement of unhealthy
//!   and expired instances
//! - Health probing of every instance through its own proxy port
//! - Multiple rotation strategies (round-robin, random, least-connections, time-based)
//! - Plain HTTP forwarding and CONNECT tunnelling, with one retry on another backend
//! - Optional Basic proxy authentication
//! - Graceful shutdown that drains connections and destroys the fleet

pub mod cloud;
pub mod config;
pub mod error;
pub mod fleet;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod tester;

pub use config::Config;
pub use error::{FleetError, Result};
pub use fleet::Fleet;
pub use pool::{OrchestratorHandle, ShutdownReport};
