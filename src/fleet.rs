//! Fleet service
//!
//! Wires the orchestrator and the proxy entry point together and owns their
//! lifecycle: [`Fleet::start`] returns once the listener is bound, and
//! [`Fleet::shutdown`] runs the graceful shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::cloud::{create_provider, CloudProvider};
use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::pool::{Orchestrator, OrchestratorHandle, RoutingTable, ShutdownReport};
use crate::proxy::{
    create_policy, ConnectionTracker, HealthProbe, ProxyAuth, ProxyHandler, ProxyHandlerConfig,
    ProxyProber, ProxyServer, RotationStrategy,
};

/// A running proxy fleet
pub struct Fleet {
    handle: OrchestratorHandle,
    local_addr: SocketAddr,
    tracker: Arc<ConnectionTracker>,
    stop_accepting: watch::Sender<bool>,
    abort_connections: watch::Sender<bool>,
    server_task: JoinHandle<Result<()>>,
    orchestrator_task: JoinHandle<()>,
}

impl Fleet {
    /// Start the fleet described by `config`
    pub async fn start(config: &Config) -> Result<Self> {
        config.validate()?;
        let provider = create_provider(&config.provider)?;
        let probe = Arc::new(ProxyProber::from_config(&config.health_check));
        Self::start_with(config, provider, probe).await
    }

    /// Start with an explicit provider and prober
    #[instrument(skip_all, fields(provider = provider.name()))]
    pub async fn start_with(
        config: &Config,
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let strategy = RotationStrategy::parse(&config.proxy.rotation).ok_or_else(|| {
            FleetError::Config(format!("unknown rotation strategy: {}", config.proxy.rotation))
        })?;
        let policy = create_policy(strategy, config.proxy.rotation_interval());

        let routing = Arc::new(RoutingTable::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let (abort_connections, abort_rx) = watch::channel(false);

        let handler = Arc::new(ProxyHandler::new(
            routing.clone(),
            policy,
            tracker.clone(),
            ProxyHandlerConfig::from(&config.proxy),
            abort_rx,
        ));
        let auth = ProxyAuth::from_config(config.proxy.auth.as_ref());
        let auth_enabled = auth.is_enabled();
        let server = ProxyServer::bind(&config.proxy_addr(), handler, auth).await?;
        let local_addr = server.local_addr()?;

        let (orchestrator, handle) =
            Orchestrator::new(config, provider, probe, routing, tracker.clone());
        let orchestrator_task = orchestrator.spawn();

        let (stop_accepting, stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(stop_rx));

        info!(
            addr = %local_addr,
            rotation = strategy.as_str(),
            auth = auth_enabled,
            "Fleet started"
        );

        Ok(Self {
            handle,
            local_addr,
            tracker,
            stop_accepting,
            abort_connections,
            server_task,
            orchestrator_task,
        })
    }

    /// Address the proxy entry point is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    /// Client connections currently relayed
    pub fn active_connections(&self) -> usize {
        self.tracker.total()
    }

    /// Stop accepting clients, drain, destroy the fleet and close whatever
    /// connections are left
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        info!("Shutting down fleet");
        let _ = self.stop_accepting.send(true);

        let report = self.handle.shutdown().await;
        let _ = self.abort_connections.send(true);

        match self.server_task.await {
            Ok(Err(e)) => warn!(error = %e, "Proxy server exited with error"),
            Err(e) => warn!(error = %e, "Proxy server task failed"),
            Ok(Ok(())) => {}
        }
        if let Err(e) = self.orchestrator_task.await {
            warn!(error = %e, "Orchestrator task failed");
        }

        let report = report?;
        info!(
            destroyed = report.destroyed,
            failed = report.failed,
            left_running = report.left_running,
            "Fleet stopped"
        );
        Ok(report)
    }
}
