//! Provisioning capability
//!
//! The orchestrator only ever talks to a cloud through [`CloudProvider`]. Each
//! concrete provider is selected once at startup by [`create_provider`].

mod static_hosts;

#[cfg(test)]
pub(crate) mod mock;

pub use static_hosts::StaticProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::error::{FleetError, Result};

/// Errors reported by a cloud provider API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider API call failed: {0}")]
    Api(String),

    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("provider call timed out")]
    Timeout,
}

impl ProviderError {
    /// Destroying an instance the provider no longer knows about is a success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Lifecycle status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Running,
    Stopping,
    Terminated,
    Unknown,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Running => "running",
            ProviderStatus::Stopping => "stopping",
            ProviderStatus::Terminated => "terminated",
            ProviderStatus::Unknown => "unknown",
        }
    }

    /// The instance is gone or on its way out and will never serve traffic.
    pub fn is_gone(&self) -> bool {
        matches!(self, ProviderStatus::Stopping | ProviderStatus::Terminated)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider view of a single instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub id: String,
    pub status: ProviderStatus,
    /// `host:port` of the proxy process, once the provider has assigned one
    pub address: Option<String>,
}

/// Capability set of a cloud provider
///
/// Implementations must be safe to call concurrently for different
/// instances. `destroy_instance` must be idempotent: destroying an instance
/// that is already gone is not an error.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &'static str;

    /// Request a new instance, returning its provider-assigned id
    async fn create_instance(&self) -> ProviderResult<String>;

    /// Destroy an instance
    async fn destroy_instance(&self, id: &str) -> ProviderResult<()>;

    /// Current status (and address, once known) of an instance
    async fn instance_status(&self, id: &str) -> ProviderResult<InstanceDescription>;

    /// Ids of every instance this provider currently runs for us
    async fn list_instances(&self) -> ProviderResult<Vec<String>>;
}

/// Create the provider named by the configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn CloudProvider>> {
    match config.kind.to_lowercase().as_str() {
        "static" => Ok(Arc::new(StaticProvider::new(
            config.static_hosts.addresses.clone(),
        ))),
        other => Err(FleetError::Config(format!(
            "unsupported provider type: {}",
            other
        ))),
    }
}
