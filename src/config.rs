//! Fleet configuration
//!
//! Loaded from a JSON file. Every field carries a default, so a user file only
//! needs to spell out what differs from the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FleetError, Result};
use crate::proxy::rotation::RotationStrategy;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-facing proxy entry point
    pub proxy: ProxyServerConfig,
    /// Per-instance policy
    pub instance: InstanceConfig,
    /// Pool size bounds
    pub scaling: ScalingConfig,
    /// Reconciliation loop tuning
    pub orchestrator: OrchestratorConfig,
    /// Instance health probing
    pub health_check: HealthCheckConfig,
    /// Cloud provider selection
    pub provider: ProviderConfig,
    /// Log file output
    pub logs: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the proxy entry point (default: 8888)
    pub port: u16,
    /// Timeout for dialing a backend, in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for a forwarded HTTP request, in milliseconds
    pub request_timeout_ms: u64,
    /// Rotation strategy (round_robin, random, least_connections, time_based)
    pub rotation: String,
    /// How long the time_based strategy sticks to one backend
    pub rotation_interval_secs: u64,
    /// Basic credentials clients must present, if any
    pub auth: Option<ProxyAuthConfig>,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            rotation: "round_robin".to_string(),
            rotation_interval_secs: 60,
            auth: None,
        }
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Proxy port on instances whose provider reports a bare host
    pub port: u16,
    /// Retire an instance once it has been alive this long (None = never)
    pub max_lifetime_secs: Option<u64>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            port: 3128,
            max_lifetime_secs: None,
        }
    }
}

impl InstanceConfig {
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Capacity kept at all times
    pub min: usize,
    /// Hard ceiling on live instances
    pub max: usize,
    /// Size to scale up to while clients are sending traffic
    pub required: Option<usize>,
    /// Idle time after which the pool falls back to `min`
    pub downscale_delay_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 5,
            required: None,
            downscale_delay_secs: 600,
        }
    }
}

impl ScalingConfig {
    pub fn downscale_delay(&self) -> Duration {
        Duration::from_secs(self.downscale_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub reconcile_interval_ms: u64,
    /// Budget for an instance to go from created to ready
    pub provisioning_timeout_secs: u64,
    /// Timeout applied to every provider call
    pub provider_timeout_ms: u64,
    /// Consecutive failed probes that retire a ready instance
    pub failure_threshold: u32,
    /// Max time a retiring instance may keep draining before it is destroyed
    pub retire_grace_secs: u64,
    /// Max time shutdown waits for client connections to finish
    pub drain_timeout_secs: u64,
    /// Destroy attempts before giving up on an instance
    pub destroy_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Skip destroying instances on shutdown
    pub leave_instances_running: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 2_000,
            provisioning_timeout_secs: 300,
            provider_timeout_ms: 30_000,
            failure_threshold: 5,
            retire_grace_secs: 30,
            drain_timeout_secs: 10,
            destroy_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            leave_instances_running: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn retire_grace(&self) -> Duration {
        Duration::from_secs(self.retire_grace_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// URL fetched through an instance to prove it proxies traffic
    pub url: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            url: "http://example.com/".to_string(),
            interval_ms: 10_000,
            timeout_ms: 5_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "static")]
    pub static_hosts: StaticProviderConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "static".to_string(),
            static_hosts: StaticProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticProviderConfig {
    /// `host:port` of each pre-provisioned proxy host
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory receiving a timestamped log file, if set
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load, merge over defaults, and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot honour
    pub fn validate(&self) -> Result<()> {
        let scaling = &self.scaling;
        if scaling.max == 0 {
            return Err(FleetError::Config("scaling.max must be at least 1".into()));
        }
        if scaling.min > scaling.max {
            return Err(FleetError::Config(format!(
                "scaling.min ({}) must not exceed scaling.max ({})",
                scaling.min, scaling.max
            )));
        }
        if let Some(required) = scaling.required {
            if required < scaling.min || required > scaling.max {
                return Err(FleetError::Config(format!(
                    "scaling.required ({}) must lie within [{}, {}]",
                    required, scaling.min, scaling.max
                )));
            }
        }

        if self.proxy.connect_timeout_ms == 0 || self.proxy.request_timeout_ms == 0 {
            return Err(FleetError::Config(
                "proxy connect and request timeouts must be non-zero".into(),
            ));
        }

        if self.instance.port == 0 {
            return Err(FleetError::Config("instance.port must be non-zero".into()));
        }

        let orch = &self.orchestrator;
        if orch.reconcile_interval_ms == 0
            || orch.provisioning_timeout_secs == 0
            || orch.provider_timeout_ms == 0
        {
            return Err(FleetError::Config(
                "orchestrator intervals and timeouts must be non-zero".into(),
            ));
        }
        if orch.failure_threshold == 0 {
            return Err(FleetError::Config(
                "orchestrator.failure_threshold must be at least 1".into(),
            ));
        }
        if orch.destroy_retries == 0 {
            return Err(FleetError::Config(
                "orchestrator.destroy_retries must be at least 1".into(),
            ));
        }

        if self.health_check.interval_ms == 0 || self.health_check.timeout_ms == 0 {
            return Err(FleetError::Config(
                "health_check interval and timeout must be non-zero".into(),
            ));
        }
        let url = Url::parse(&self.health_check.url).map_err(|e| {
            FleetError::Config(format!("health_check.url must be a valid URL: {}", e))
        })?;
        if url.scheme() != "http" {
            return Err(FleetError::Config(
                "health_check.url must use the http scheme".into(),
            ));
        }

        if RotationStrategy::parse(&self.proxy.rotation).is_none() {
            return Err(FleetError::Config(format!(
                "unknown rotation strategy: {}",
                self.proxy.rotation
            )));
        }

        match self.provider.kind.to_lowercase().as_str() {
            "static" => {
                if self.provider.static_hosts.addresses.is_empty() {
                    return Err(FleetError::Config(
                        "provider.static.addresses must list at least one host".into(),
                    ));
                }
            }
            other => {
                return Err(FleetError::Config(format!(
                    "unsupported provider type: {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Starter configuration written by `init`
    pub fn template() -> String {
        let mut config = Config::default();
        config.provider.static_hosts.addresses = vec![
            "10.0.0.10:3128".to_string(),
            "10.0.0.11:3128".to_string(),
        ];
        config.proxy.auth = Some(ProxyAuthConfig {
            username: "changeme".to_string(),
            password: "changeme".to_string(),
        });
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}
