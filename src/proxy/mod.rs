//! Client-facing proxy
//!
//! This module provides:
//! - HTTP CONNECT tunneling and absolute-URI forwarding to fleet backends
//! - Pluggable rotation policies
//! - Backend health probing

pub mod handler;
pub mod health;
pub mod middleware;
pub mod rotation;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use health::{HealthProbe, ProbeOutcome, ProxyProber};
pub use middleware::ProxyAuth;
pub use rotation::{create_policy, ConnectionTracker, RotationPolicy, RotationStrategy};
pub use server::ProxyServer;
pub use transport::BackendTransport;
pub use tunnel::TunnelHandler;
