//! Reconciliation task
//!
//! The [`Orchestrator`] is the only writer of the [`Pool`]. Provider calls and
//! probes run as independent tasks that report back over a channel, so a
//! stuck call for one instance never delays work on the others.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use super::routing::{RoutingSnapshot, RoutingTable};
use super::state::{Action, Event, Pool, PoolCounts, PoolSettings};
use crate::cloud::{CloudProvider, ProviderError, ProviderResult};
use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::models::InstanceView;
use crate::proxy::health::{HealthProbe, ProbeOutcome};
use crate::proxy::rotation::ConnectionTracker;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Timing and shutdown policy of the reconciliation task
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub reconcile_interval: Duration,
    pub provider_timeout: Duration,
    pub probe_timeout: Duration,
    pub drain_timeout: Duration,
    pub leave_instances_running: bool,
    pub required: Option<usize>,
    pub downscale_delay: Duration,
    pub destroy_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            reconcile_interval: config.orchestrator.reconcile_interval(),
            provider_timeout: config.orchestrator.provider_timeout(),
            probe_timeout: config.health_check.timeout(),
            drain_timeout: config.orchestrator.drain_timeout(),
            leave_instances_running: config.orchestrator.leave_instances_running,
            required: config.scaling.required,
            downscale_delay: config.scaling.downscale_delay(),
            destroy_retries: config.orchestrator.destroy_retries,
            backoff_base: config.orchestrator.backoff_base(),
            backoff_max: config.orchestrator.backoff_max(),
        }
    }
}

/// What the graceful shutdown did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Instances confirmed destroyed
    pub destroyed: usize,
    /// Instances whose destroy budget ran out
    pub failed: usize,
    /// Instances deliberately left running
    pub left_running: usize,
}

enum Command {
    Scale {
        size: usize,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Cloneable access to a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    routing: Arc<RoutingTable>,
    views: watch::Receiver<Vec<InstanceView>>,
}

impl OrchestratorHandle {
    /// Current routing table snapshot
    pub fn routing_table(&self) -> Arc<RoutingSnapshot> {
        self.routing.load()
    }

    /// Copy of every tracked instance, oldest first
    pub fn instances(&self) -> Vec<InstanceView> {
        self.views.borrow().clone()
    }

    /// Change the desired pool size; returns the size actually applied
    pub async fn scale(&self, size: usize) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Scale { size, reply })
            .await
            .map_err(|_| FleetError::ShuttingDown)?;
        rx.await.map_err(|_| FleetError::ShuttingDown)
    }

    /// Run the graceful shutdown sequence and wait for it to finish
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| FleetError::ShuttingDown)?;
        rx.await.map_err(|_| FleetError::ShuttingDown)
    }
}

/// Pool Orchestrator
pub struct Orchestrator {
    pool: Pool,
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn HealthProbe>,
    routing: Arc<RoutingTable>,
    tracker: Arc<ConnectionTracker>,
    settings: OrchestratorSettings,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    views: watch::Sender<Vec<InstanceView>>,
    last_counts: PoolCounts,
    traffic_seen: bool,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn HealthProbe>,
        routing: Arc<RoutingTable>,
        tracker: Arc<ConnectionTracker>,
    ) -> (Self, OrchestratorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (views_tx, views_rx) = watch::channel(Vec::new());

        let handle = OrchestratorHandle {
            commands: commands_tx,
            routing: routing.clone(),
            views: views_rx,
        };

        let orchestrator = Self {
            pool: Pool::new(PoolSettings::from(config)),
            provider,
            probe,
            routing,
            tracker,
            settings: OrchestratorSettings::from(config),
            events_tx,
            events_rx,
            commands: commands_rx,
            views: views_tx,
            last_counts: PoolCounts::default(),
            traffic_seen: false,
        };

        (orchestrator, handle)
    }

    /// Run the reconciliation loop in a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(provider = self.provider.name()))]
    async fn run(mut self) {
        info!(
            min = self.pool.settings().min,
            max = self.pool.settings().max,
            interval_ms = self.settings.reconcile_interval.as_millis() as u64,
            "Starting orchestrator"
        );
        self.adopt_existing().await;

        let mut ticker = interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Scale { size, reply }) => {
                        let applied = self.pool.set_desired(size);
                        let _ = reply.send(applied);
                        self.tick();
                    }
                    Some(Command::Shutdown { reply }) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        warn!("All orchestrator handles dropped, shutting down");
                        self.shutdown().await;
                        return;
                    }
                },
            }
        }
    }

    async fn adopt_existing(&mut self) {
        let listed = with_timeout(self.settings.provider_timeout, self.provider.list_instances()).await;
        match listed {
            Ok(ids) if ids.is_empty() => debug!("No pre-existing instances"),
            Ok(ids) => {
                info!(count = ids.len(), "Adopting pre-existing instances");
                self.pool.adopt(ids, Instant::now());
                self.publish();
            }
            Err(e) => warn!(error = %e, "Could not list existing instances, starting empty"),
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.autoscale();
        let actions = self.pool.reconcile(now, &self.tracker);
        self.dispatch(actions);
        self.publish();
    }

    fn handle_event(&mut self, event: Event) {
        let actions = self.pool.apply(event, Instant::now());
        self.dispatch(actions);
        self.publish();
    }

    /// Follow client demand when `scaling.required` is set
    fn autoscale(&mut self) {
        let Some(required) = self.settings.required else {
            return;
        };
        let busy = self.tracker.total() > 0
            || self
                .tracker
                .idle_for()
                .map_or(false, |idle| idle < self.settings.downscale_delay);
        if busy == self.traffic_seen {
            return;
        }
        self.traffic_seen = busy;
        let target = if busy {
            required
        } else {
            self.pool.settings().min
        };
        info!(busy = busy, target = target, "Client demand changed");
        self.pool.set_desired(target);
    }

    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            let tx = self.events_tx.clone();
            let provider = self.provider.clone();
            let limit = self.settings.provider_timeout;

            match action {
                Action::Create { key } => {
                    tokio::spawn(async move {
                        let result = with_timeout(limit, provider.create_instance()).await;
                        let _ = tx.send(Event::Created { key, result });
                    });
                }
                Action::PollStatus { key, provider_id } => {
                    tokio::spawn(async move {
                        let result =
                            with_timeout(limit, provider.instance_status(&provider_id)).await;
                        let _ = tx.send(Event::Status { key, result });
                    });
                }
                Action::Probe { key, address } => {
                    let probe = self.probe.clone();
                    let limit = self.settings.probe_timeout;
                    tokio::spawn(async move {
                        let outcome = timeout(limit, probe.probe(&address))
                            .await
                            .unwrap_or_else(|_| ProbeOutcome::Unhealthy("probe timed out".into()));
                        let _ = tx.send(Event::Probed { key, outcome });
                    });
                }
                Action::Destroy { key, provider_id } => {
                    tokio::spawn(async move {
                        let result =
                            with_timeout(limit, provider.destroy_instance(&provider_id)).await;
                        let _ = tx.send(Event::Destroyed { key, result });
                    });
                }
            }
        }
    }

    fn publish(&mut self) {
        if self.routing.publish(self.pool.routable()) {
            let snapshot = self.routing.load();
            info!(
                version = snapshot.version,
                backends = snapshot.len(),
                "Routing table updated"
            );
        }
        self.views.send_replace(self.pool.views());

        let counts = self.pool.counts();
        if counts != self.last_counts {
            info!(desired = self.pool.desired(), "Pool: {}", counts);
            self.last_counts = counts;
        }
    }

    /// Graceful shutdown: stop routing, drain, settle, then destroy
    async fn shutdown(&mut self) -> ShutdownReport {
        info!("Orchestrator shutting down");
        self.pool.begin_shutdown();
        self.publish();

        let drain_deadline = Instant::now() + self.settings.drain_timeout;
        while self.tracker.total() > 0 && Instant::now() < drain_deadline {
            sleep(DRAIN_POLL).await;
        }
        let open = self.tracker.total();
        if open > 0 {
            warn!(connections = open, "Drain period elapsed with connections still open");
        } else {
            debug!("All client connections drained");
        }

        // Let in-flight creates land so their instances get destroyed too.
        let settle_deadline = tokio::time::Instant::now() + self.settings.provider_timeout;
        while self.pool.pending_creates() > 0 || self.pool.pending_destroys() > 0 {
            match tokio::time::timeout_at(settle_deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    self.pool.apply(event, Instant::now());
                }
                _ => {
                    warn!(
                        creates = self.pool.pending_creates(),
                        destroys = self.pool.pending_destroys(),
                        "Provider calls still outstanding at shutdown"
                    );
                    break;
                }
            }
        }

        let mut report = ShutdownReport::default();
        if self.settings.leave_instances_running {
            report.left_running = self.pool.provider_ids().len();
            info!(count = report.left_running, "Leaving instances running");
            self.views.send_replace(self.pool.views());
            return report;
        }

        let targets = self.pool.drain_for_shutdown(Instant::now());
        info!(count = targets.len(), "Destroying instances");

        let backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let results = join_all(targets.into_iter().map(|(key, provider_id)| {
            let provider = self.provider.clone();
            let backoff = backoff.clone();
            let limit = self.settings.provider_timeout;
            let retries = self.settings.destroy_retries;
            async move {
                let result = destroy_with_retry(provider, &provider_id, limit, retries, backoff).await;
                (key, provider_id, result)
            }
        }))
        .await;

        for (key, provider_id, result) in results {
            match result {
                Ok(()) => report.destroyed += 1,
                Err(e) => {
                    error!(
                        instance = %key,
                        provider_id = %provider_id,
                        error = %e,
                        "Giving up on destroying instance; manual intervention required"
                    );
                    report.failed += 1;
                }
            }
            self.pool.forget(&key);
        }

        self.views.send_replace(self.pool.views());
        info!(
            destroyed = report.destroyed,
            failed = report.failed,
            "Orchestrator stopped"
        );
        report
    }
}

/// Bound a provider call, mapping expiry to [`ProviderError::Timeout`]
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(ProviderError::Timeout))
}

async fn destroy_with_retry(
    provider: Arc<dyn CloudProvider>,
    provider_id: &str,
    limit: Duration,
    retries: u32,
    backoff: Backoff,
) -> ProviderResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(limit, provider.destroy_instance(provider_id)).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if attempt >= retries => return Err(e),
            Err(e) => {
                let delay = backoff.delay_for(attempt);
                warn!(
                    provider_id = provider_id,
                    attempt = attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Destroy failed, will retry"
                );
                sleep(delay).await;
            }
        }
    }
}
