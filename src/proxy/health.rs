//! Health probing for fleet instances
//!
//! A probe is one proxied HTTP round-trip through the candidate backend. The
//! prober only reports what it saw; the orchestrator decides what it means.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::HealthCheckConfig;
use crate::error::{FleetError, Result};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Healthy { latency } => write!(f, "healthy ({}ms)", latency.as_millis()),
            ProbeOutcome::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
        }
    }
}

/// Checks whether a backend address is serving proxy traffic
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeOutcome;
}

/// Fetches a known URL through the backend as a forward proxy
pub struct ProxyProber {
    check_url: String,
    host_header: Option<String>,
    check_timeout: Duration,
}

impl ProxyProber {
    pub fn new(check_url: impl Into<String>, check_timeout: Duration) -> Self {
        let check_url = check_url.into();
        let host_header = url::Url::parse(&check_url).ok().and_then(|u| {
            let host = u.host_str()?.to_string();
            Some(match u.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            })
        });
        Self {
            check_url,
            host_header,
            check_timeout,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.url.clone(), config.timeout())
    }

    async fn fetch(&self, address: &str) -> Result<StatusCode> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| FleetError::HealthCheckFailure(format!("connect failed: {}", e)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| FleetError::HealthCheckFailure(format!("handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Probe connection ended: {}", e);
            }
        });

        let mut builder = Request::get(self.check_url.as_str());
        if let Some(host) = &self.host_header {
            builder = builder.header(HOST, host.as_str());
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| FleetError::Internal(format!("invalid probe request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FleetError::HealthCheckFailure(format!("request failed: {}", e)))?;
        Ok(response.status())
    }
}

#[async_trait]
impl HealthProbe for ProxyProber {
    #[instrument(skip(self))]
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let start = Instant::now();
        match timeout(self.check_timeout, self.fetch(address)).await {
            Ok(Ok(status)) if status.is_success() || status.is_redirection() => {
                let latency = start.elapsed();
                debug!(status = status.as_u16(), latency_ms = latency.as_millis() as u64, "Probe passed");
                ProbeOutcome::Healthy { latency }
            }
            Ok(Ok(status)) => ProbeOutcome::Unhealthy(format!("upstream returned {}", status)),
            Ok(Err(e)) => ProbeOutcome::Unhealthy(e.to_string()),
            Err(_) => ProbeOutcome::Unhealthy("probe timed out".to_string()),
        }
    }
}

/// Scripted probe for orchestrator tests
#[cfg(test)]
pub(crate) struct MockProbe {
    default_healthy: std::sync::atomic::AtomicBool,
    overrides: parking_lot::Mutex<std::collections::HashMap<String, bool>>,
}

#[cfg(test)]
impl MockProbe {
    pub(crate) fn healthy() -> Self {
        Self {
            default_healthy: std::sync::atomic::AtomicBool::new(true),
            overrides: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub(crate) fn set(&self, address: &str, healthy: bool) {
        self.overrides.lock().insert(address.to_string(), healthy);
    }
}

#[cfg(test)]
#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let healthy = self
            .overrides
            .lock()
            .get(address)
            .copied()
            .unwrap_or_else(|| {
                self.default_healthy
                    .load(std::sync::atomic::Ordering::SeqCst)
            });
        if healthy {
            ProbeOutcome::Healthy {
                latency: Duration::from_millis(1),
            }
        } else {
            ProbeOutcome::Unhealthy("scripted failure".to_string())
        }
    }
}
