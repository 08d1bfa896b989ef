//! Pool registry and instance state machine
//!
//! [`Pool`] is plain data: it decides what should happen next
//! ([`Pool::reconcile`]) and folds in what did happen ([`Pool::apply`]), but it
//! never performs I/O itself. The orchestrator task owns the only `Pool` and
//! turns the returned [`Action`]s into provider calls and probes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::cloud::{InstanceDescription, ProviderResult, ProviderStatus};
use crate::config::Config;
use crate::error::FleetError;
use crate::models::{Backend, Instance, InstanceKey, InstanceState, InstanceView, Transition};
use crate::proxy::health::ProbeOutcome;
use crate::proxy::rotation::ConnectionTracker;

/// Policy knobs of the state machine
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min: usize,
    pub max: usize,
    pub failure_threshold: u32,
    pub provisioning_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub retire_grace: Duration,
    pub health_interval: Duration,
    pub destroy_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Port assumed when the provider reports a bare host
    pub instance_port: u16,
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            min: config.scaling.min,
            max: config.scaling.max,
            failure_threshold: config.orchestrator.failure_threshold,
            provisioning_timeout: config.orchestrator.provisioning_timeout(),
            max_lifetime: config.instance.max_lifetime(),
            retire_grace: config.orchestrator.retire_grace(),
            health_interval: config.health_check.interval(),
            destroy_retries: config.orchestrator.destroy_retries,
            backoff_base: config.orchestrator.backoff_base(),
            backoff_max: config.orchestrator.backoff_max(),
            instance_port: config.instance.port,
        }
    }
}

/// Work the orchestrator must carry out on behalf of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create { key: InstanceKey },
    PollStatus { key: InstanceKey, provider_id: String },
    Probe { key: InstanceKey, address: String },
    Destroy { key: InstanceKey, provider_id: String },
}

/// Outcome of a finished action
#[derive(Debug, Clone)]
pub enum Event {
    Created {
        key: InstanceKey,
        result: ProviderResult<String>,
    },
    Status {
        key: InstanceKey,
        result: ProviderResult<InstanceDescription>,
    },
    Probed {
        key: InstanceKey,
        outcome: ProbeOutcome,
    },
    Destroyed {
        key: InstanceKey,
        result: ProviderResult<()>,
    },
}

impl Event {
    pub fn key(&self) -> InstanceKey {
        match self {
            Event::Created { key, .. }
            | Event::Status { key, .. }
            | Event::Probed { key, .. }
            | Event::Destroyed { key, .. } => *key,
        }
    }
}

/// Per-state instance counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub requested: usize,
    pub booting: usize,
    pub starting: usize,
    pub ready: usize,
    pub retiring: usize,
    pub dead: usize,
}

impl std::fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requested={} booting={} starting={} ready={} retiring={} dead={}",
            self.requested, self.booting, self.starting, self.ready, self.retiring, self.dead
        )
    }
}

/// The orchestrator's registry of instances
pub struct Pool {
    instances: HashMap<InstanceKey, Instance>,
    settings: PoolSettings,
    desired: usize,
    create_backoff: Backoff,
    accepting: bool,
}

impl Pool {
    pub fn new(settings: PoolSettings) -> Self {
        let create_backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
        Self {
            instances: HashMap::new(),
            desired: settings.min,
            settings,
            create_backoff,
            accepting: true,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Set the target size, clamped to `[min, max]`
    pub fn set_desired(&mut self, desired: usize) -> usize {
        let clamped = desired.clamp(self.settings.min, self.settings.max);
        if clamped != self.desired {
            info!(from = self.desired, to = clamped, "Desired pool size changed");
            self.desired = clamped;
        }
        clamped
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &InstanceKey) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for instance in self.instances.values() {
            match instance.state {
                InstanceState::Requested => counts.requested += 1,
                InstanceState::Booting => counts.booting += 1,
                InstanceState::Starting => counts.starting += 1,
                InstanceState::Ready => counts.ready += 1,
                InstanceState::Retiring => counts.retiring += 1,
                InstanceState::Dead => counts.dead += 1,
            }
        }
        counts
    }

    /// Instances serving or progressing toward serving
    pub fn capacity(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state.is_capacity())
            .count()
    }

    /// Instances in any state but `DEAD`
    pub fn live(&self) -> usize {
        self.instances.values().filter(|i| i.state.is_live()).count()
    }

    /// `create_instance` calls not yet answered
    pub fn pending_creates(&self) -> usize {
        self.instances.values().filter(|i| i.awaiting_create()).count()
    }

    /// `destroy_instance` calls not yet answered
    pub fn pending_destroys(&self) -> usize {
        self.instances.values().filter(|i| i.destroying).count()
    }

    pub fn views(&self) -> Vec<InstanceView> {
        let mut views: Vec<InstanceView> = self.instances.values().map(Instance::view).collect();
        views.sort_by_key(|v| (v.created_at, v.key));
        views
    }

    /// Backends eligible for new connections: every `READY` instance, ordered
    /// by age, or nothing once shutdown has begun
    pub fn routable(&self) -> Vec<Backend> {
        if !self.accepting {
            return Vec::new();
        }
        let mut ready: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Ready)
            .collect();
        ready.sort_by_key(|i| (i.created_at, i.key));
        ready
            .into_iter()
            .filter_map(|i| i.address.as_ref().map(|a| Backend::new(i.key, a.clone())))
            .collect()
    }

    /// Take over instances that already exist at the provider
    pub fn adopt(&mut self, provider_ids: Vec<String>, now: Instant) {
        for provider_id in provider_ids {
            let already_known = self
                .instances
                .values()
                .any(|i| i.provider_id.as_deref() == Some(provider_id.as_str()));
            if already_known {
                continue;
            }
            let instance = Instance::adopted(provider_id, now);
            info!(
                instance = %instance.key,
                provider_id = instance.provider_id.as_deref().unwrap_or("-"),
                "Adopted existing instance"
            );
            self.instances.insert(instance.key, instance);
        }
    }

    /// Run one reconciliation pass
    pub fn reconcile(&mut self, now: Instant, tracker: &ConnectionTracker) -> Vec<Action> {
        let mut actions = Vec::new();
        let settings = self.settings.clone();

        for instance in self.instances.values_mut() {
            match instance.state {
                InstanceState::Requested | InstanceState::Dead => {}
                InstanceState::Booting | InstanceState::Starting => {
                    if instance.age(now) >= settings.provisioning_timeout {
                        let err = FleetError::ProvisioningTimeout {
                            instance: instance.key.to_string(),
                            elapsed_secs: instance.age(now).as_secs(),
                        };
                        warn!(state = %instance.state, error = %err, "Replacing instance");
                        instance.transition(
                            InstanceState::Dead,
                            Transition::ProvisioningTimeout,
                            now,
                        );
                    } else if !instance.in_flight {
                        if let Some(action) = observe(instance) {
                            instance.in_flight = true;
                            actions.push(action);
                        }
                    }
                }
                InstanceState::Ready => {
                    let expired = settings
                        .max_lifetime
                        .map_or(false, |lifetime| instance.age(now) >= lifetime);
                    if expired {
                        instance.transition(
                            InstanceState::Retiring,
                            Transition::LifetimeExpired,
                            now,
                        );
                    } else if instance.failure_count >= settings.failure_threshold {
                        instance.transition(
                            InstanceState::Retiring,
                            Transition::HealthThreshold,
                            now,
                        );
                    } else if !instance.in_flight
                        && instance
                            .last_probe_at
                            .map_or(true, |at| now.saturating_duration_since(at) >= settings.health_interval)
                    {
                        if let Some(action) = observe(instance) {
                            instance.in_flight = true;
                            actions.push(action);
                        }
                    }
                }
                InstanceState::Retiring => {
                    if tracker.get(&instance.key) == 0 {
                        instance.transition(InstanceState::Dead, Transition::Drained, now);
                    } else if instance.time_in_state(now) >= settings.retire_grace {
                        warn!(
                            instance = %instance.key,
                            connections = tracker.get(&instance.key),
                            "Grace period elapsed with connections still open"
                        );
                        instance.transition(InstanceState::Dead, Transition::GraceElapsed, now);
                    }
                }
            }
        }

        self.shrink_to_desired(now);
        actions.extend(self.fill_deficit(now));
        actions.extend(self.collect_destroys(now));
        actions
    }

    /// Fold a finished action back into the pool
    ///
    /// Events for records that no longer exist are ignored. The returned
    /// actions are immediate follow-ups (e.g. probing an instance the moment
    /// its address is known).
    pub fn apply(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let key = event.key();
        if !self.instances.contains_key(&key) {
            debug!(instance = %key, "Ignoring late result for removed instance");
            return Vec::new();
        }

        match event {
            Event::Created { result, .. } => self.on_created(key, result, now),
            Event::Status { result, .. } => self.on_status(key, result, now),
            Event::Probed { outcome, .. } => self.on_probed(key, outcome, now),
            Event::Destroyed { result, .. } => {
                self.on_destroyed(key, result, now);
                Vec::new()
            }
        }
    }

    /// Stop creating capacity and take every backend out of routing
    pub fn begin_shutdown(&mut self) {
        self.accepting = false;
    }

    /// Mark every remaining instance `DEAD` and hand back the provider ids
    /// that still need destroying. Instances already being destroyed are
    /// left to their in-flight call.
    pub fn drain_for_shutdown(&mut self, now: Instant) -> Vec<(InstanceKey, String)> {
        let mut targets = Vec::new();
        for instance in self.instances.values_mut() {
            if instance.state.is_live() {
                instance.transition(InstanceState::Dead, Transition::Shutdown, now);
            }
            if instance.destroying {
                continue;
            }
            if let Some(id) = &instance.provider_id {
                targets.push((instance.key, id.clone()));
            }
        }
        targets
    }

    /// Drop a record without waiting for the provider
    pub fn forget(&mut self, key: &InstanceKey) -> Option<Instance> {
        self.instances.remove(key)
    }

    /// Provider ids of every tracked instance
    pub fn provider_ids(&self) -> Vec<String> {
        self.instances
            .values()
            .filter_map(|i| i.provider_id.clone())
            .collect()
    }

    fn on_created(
        &mut self,
        key: InstanceKey,
        result: ProviderResult<String>,
        now: Instant,
    ) -> Vec<Action> {
        match result {
            Ok(provider_id) => {
                self.create_backoff.record_success();
                let accepting = self.accepting;
                let Some(instance) = self.instances.get_mut(&key) else {
                    return Vec::new();
                };
                instance.in_flight = false;
                instance.provider_id = Some(provider_id.clone());

                // Scaled away while the create was outstanding.
                if instance.state == InstanceState::Dead {
                    info!(instance = %key, provider_id = %provider_id, "Destroying instance no longer needed");
                    instance.destroying = true;
                    instance.destroy_attempts += 1;
                    return vec![Action::Destroy { key, provider_id }];
                }
                instance.transition(InstanceState::Booting, Transition::Created, now);

                if !accepting {
                    return Vec::new();
                }
                instance.in_flight = true;
                vec![Action::PollStatus { key, provider_id }]
            }
            Err(e) => {
                self.instances.remove(&key);
                let delay = self.create_backoff.record_failure(now);
                warn!(
                    instance = %key,
                    error = %e,
                    failures = self.create_backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Instance creation failed"
                );
                Vec::new()
            }
        }
    }

    fn on_status(
        &mut self,
        key: InstanceKey,
        result: ProviderResult<InstanceDescription>,
        now: Instant,
    ) -> Vec<Action> {
        let accepting = self.accepting;
        let port = self.settings.instance_port;
        let Some(instance) = self.instances.get_mut(&key) else {
            return Vec::new();
        };
        instance.in_flight = false;
        if instance.state != InstanceState::Booting {
            return Vec::new();
        }

        match result {
            Ok(desc) if desc.status.is_gone() => {
                warn!(instance = %key, status = %desc.status, "Provider reports instance gone");
                instance.transition(InstanceState::Dead, Transition::ProviderTerminated, now);
                Vec::new()
            }
            Ok(InstanceDescription {
                status: ProviderStatus::Running,
                address: Some(address),
                ..
            }) => {
                let address = with_default_port(address, port);
                instance.address = Some(address.clone());
                instance.transition(InstanceState::Starting, Transition::AddressAssigned, now);
                if !accepting {
                    return Vec::new();
                }
                instance.in_flight = true;
                vec![Action::Probe { key, address }]
            }
            Ok(desc) => {
                debug!(instance = %key, status = %desc.status, "Instance still booting");
                Vec::new()
            }
            Err(e) if e.is_not_found() => {
                warn!(instance = %key, "Provider no longer knows instance");
                instance.transition(InstanceState::Dead, Transition::ProviderTerminated, now);
                Vec::new()
            }
            Err(e) => {
                warn!(instance = %key, error = %e, "Status poll failed");
                Vec::new()
            }
        }
    }

    fn on_probed(&mut self, key: InstanceKey, outcome: ProbeOutcome, now: Instant) -> Vec<Action> {
        let threshold = self.settings.failure_threshold;
        let Some(instance) = self.instances.get_mut(&key) else {
            return Vec::new();
        };
        instance.in_flight = false;
        instance.last_probe_at = Some(now);

        match (instance.state, outcome.is_healthy()) {
            (InstanceState::Starting, true) => {
                instance.failure_count = 0;
                instance.last_healthy_at = Some(now);
                instance.transition(InstanceState::Ready, Transition::ProbePassed, now);
            }
            (InstanceState::Starting, false) => {
                debug!(instance = %key, outcome = %outcome, "Instance not serving yet");
            }
            (InstanceState::Ready, true) => {
                instance.failure_count = 0;
                instance.last_healthy_at = Some(now);
            }
            (InstanceState::Ready, false) => {
                instance.failure_count += 1;
                warn!(
                    instance = %key,
                    outcome = %outcome,
                    failures = instance.failure_count,
                    threshold = threshold,
                    "Health probe failed"
                );
                if instance.failure_count >= threshold {
                    instance.transition(
                        InstanceState::Retiring,
                        Transition::HealthThreshold,
                        now,
                    );
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn on_destroyed(&mut self, key: InstanceKey, result: ProviderResult<()>, now: Instant) {
        let retries = self.settings.destroy_retries;
        let backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let Some(instance) = self.instances.get_mut(&key) else {
            return;
        };
        instance.destroying = false;

        match result {
            Ok(()) => {
                info!(instance = %key, "Instance destroyed");
                self.instances.remove(&key);
            }
            Err(e) if e.is_not_found() => {
                info!(instance = %key, "Instance already gone at provider");
                self.instances.remove(&key);
            }
            Err(e) if instance.destroy_attempts >= retries => {
                error!(
                    instance = %key,
                    provider_id = instance.provider_id.as_deref().unwrap_or("-"),
                    attempts = instance.destroy_attempts,
                    error = %e,
                    "Giving up on destroying instance; manual intervention required"
                );
                self.instances.remove(&key);
            }
            Err(e) => {
                let delay = backoff.delay_for(instance.destroy_attempts);
                warn!(
                    instance = %key,
                    attempt = instance.destroy_attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Destroy failed, will retry"
                );
                instance.retry_at = Some(now + delay);
            }
        }
    }

    /// Retire surplus capacity when the desired size shrinks
    fn shrink_to_desired(&mut self, now: Instant) {
        let mut surplus = self.capacity().saturating_sub(self.desired);
        if surplus == 0 {
            return;
        }

        // Outstanding creates go first, then not-yet-serving instances
        // (youngest first), then the oldest ready ones.
        let mut provisioning: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| i.state.is_provisioning())
            .collect();
        provisioning.sort_by_key(|i| {
            (
                i.state != InstanceState::Requested,
                std::cmp::Reverse(i.created_at),
            )
        });
        let mut ready: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Ready)
            .collect();
        ready.sort_by_key(|i| i.created_at);

        let victims: Vec<InstanceKey> = provisioning
            .into_iter()
            .chain(ready)
            .map(|i| i.key)
            .collect();

        for key in victims {
            if surplus == 0 {
                break;
            }
            if let Some(instance) = self.instances.get_mut(&key) {
                let to = if instance.state == InstanceState::Ready {
                    InstanceState::Retiring
                } else {
                    InstanceState::Dead
                };
                instance.transition(to, Transition::ScaledDown, now);
                surplus -= 1;
            }
        }
    }

    /// Request new instances to cover the gap between desired and capacity
    fn fill_deficit(&mut self, now: Instant) -> Vec<Action> {
        if !self.accepting || !self.create_backoff.ready(now) {
            return Vec::new();
        }

        let deficit = self.desired.saturating_sub(self.capacity());
        let room = self.settings.max.saturating_sub(self.live());
        let count = deficit.min(room);
        if count > 0 {
            info!(
                count = count,
                desired = self.desired,
                capacity = self.capacity(),
                "Requesting instances"
            );
        }

        (0..count)
            .map(|_| {
                let mut instance = Instance::requested(now);
                instance.in_flight = true;
                let key = instance.key;
                self.instances.insert(key, instance);
                Action::Create { key }
            })
            .collect()
    }

    /// Issue destroy calls for dead instances, dropping those with nothing to
    /// destroy. A dead record still waiting on its create is kept so the
    /// instance can be destroyed once the provider names it.
    fn collect_destroys(&mut self, now: Instant) -> Vec<Action> {
        let orphans: Vec<InstanceKey> = self
            .instances
            .values()
            .filter(|i| {
                i.state == InstanceState::Dead && i.provider_id.is_none() && !i.in_flight
            })
            .map(|i| i.key)
            .collect();
        for key in orphans {
            self.instances.remove(&key);
        }

        let mut actions = Vec::new();
        for instance in self.instances.values_mut() {
            if instance.state != InstanceState::Dead || instance.destroying {
                continue;
            }
            if instance.retry_at.map_or(false, |at| now < at) {
                continue;
            }
            let Some(provider_id) = instance.provider_id.clone() else {
                continue;
            };
            instance.destroying = true;
            instance.destroy_attempts += 1;
            actions.push(Action::Destroy {
                key: instance.key,
                provider_id,
            });
        }
        actions
    }
}

/// Complete a provider-reported address with the instance proxy port
fn with_default_port(address: String, port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address;
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => address,
        _ => format!("{}:{}", address, port),
    }
}

/// Next observation an instance needs: a status poll while booting, a probe
/// once it has an address
fn observe(instance: &Instance) -> Option<Action> {
    match instance.state {
        InstanceState::Booting => instance
            .provider_id
            .clone()
            .map(|provider_id| Action::PollStatus {
                key: instance.key,
                provider_id,
            }),
        InstanceState::Starting | InstanceState::Ready => {
            instance.address.clone().map(|address| Action::Probe {
                key: instance.key,
                address,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ProviderError;

    fn settings() -> PoolSettings {
        PoolSettings {
            min: 2,
            max: 5,
            failure_threshold: 5,
            provisioning_timeout: Duration::from_secs(60),
            max_lifetime: None,
            retire_grace: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            destroy_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            instance_port: 3128,
        }
    }

    fn creates(actions: &[Action]) -> Vec<InstanceKey> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Create { key } => Some(*key),
                _ => None,
            })
            .collect()
    }

    fn destroys(actions: &[Action]) -> Vec<InstanceKey> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Destroy { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }

    /// Drive a requested instance all the way to READY
    fn make_ready(pool: &mut Pool, key: InstanceKey, n: usize, now: Instant) {
        let follow = pool.apply(
            Event::Created {
                key,
                result: Ok(format!("i-{}", n)),
            },
            now,
        );
        assert!(matches!(follow.as_slice(), [Action::PollStatus { .. }]));

        let follow = pool.apply(
            Event::Status {
                key,
                result: Ok(InstanceDescription {
                    id: format!("i-{}", n),
                    status: ProviderStatus::Running,
                    address: Some(format!("10.0.0.{}:3128", n)),
                }),
            },
            now,
        );
        assert!(matches!(follow.as_slice(), [Action::Probe { .. }]));

        pool.apply(
            Event::Probed {
                key,
                outcome: ProbeOutcome::Healthy {
                    latency: Duration::from_millis(5),
                },
            },
            now,
        );
        assert_eq!(pool.get(&key).unwrap().state, InstanceState::Ready);
    }

    fn ready_pool(now: Instant, tracker: &ConnectionTracker) -> (Pool, Vec<InstanceKey>) {
        let mut pool = Pool::new(settings());
        let keys = creates(&pool.reconcile(now, tracker));
        for (n, key) in keys.iter().enumerate() {
            make_ready(&mut pool, *key, n + 1, now);
        }
        (pool, keys)
    }

    #[test]
    fn test_empty_pool_requests_min() {
        let tracker = ConnectionTracker::new();
        let mut pool = Pool::new(settings());
        let now = Instant::now();

        let actions = pool.reconcile(now, &tracker);
        assert_eq!(creates(&actions).len(), 2);
        assert_eq!(pool.counts().requested, 2);

        // Outstanding requests count as capacity: no duplicate creates.
        let actions = pool.reconcile(now + Duration::from_secs(1), &tracker);
        assert!(creates(&actions).is_empty());
    }

    #[test]
    fn test_ready_instances_become_routable() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (pool, keys) = ready_pool(now, &tracker);

        let routable = pool.routable();
        assert_eq!(routable.len(), 2);
        let mut addresses: Vec<String> = routable.into_iter().map(|b| b.address).collect();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.1:3128", "10.0.0.2:3128"]);
        assert!(keys.iter().all(|k| pool.get(k).unwrap().failure_count == 0));
    }

    #[test]
    fn test_create_failure_backs_off() {
        let tracker = ConnectionTracker::new();
        let mut pool = Pool::new(settings());
        let now = Instant::now();

        let keys = creates(&pool.reconcile(now, &tracker));
        for key in &keys {
            pool.apply(
                Event::Created {
                    key: *key,
                    result: Err(ProviderError::Api("down".into())),
                },
                now,
            );
        }
        assert!(pool.views().is_empty());

        // Two consecutive failures: 2s backoff.
        assert!(creates(&pool.reconcile(now + Duration::from_millis(500), &tracker)).is_empty());
        assert!(creates(&pool.reconcile(now + Duration::from_millis(1500), &tracker)).is_empty());
        assert_eq!(
            creates(&pool.reconcile(now + Duration::from_secs(2), &tracker)).len(),
            2
        );
    }

    #[test]
    fn test_provisioning_timeout_kills_and_replaces() {
        let tracker = ConnectionTracker::new();
        let mut pool = Pool::new(settings());
        let now = Instant::now();

        let keys = creates(&pool.reconcile(now, &tracker));
        pool.apply(
            Event::Created {
                key: keys[0],
                result: Ok("i-slow".into()),
            },
            now,
        );
        pool.apply(
            Event::Status {
                key: keys[0],
                result: Ok(InstanceDescription {
                    id: "i-slow".into(),
                    status: ProviderStatus::Pending,
                    address: None,
                }),
            },
            now,
        );
        make_ready(&mut pool, keys[1], 2, now);

        let later = now + Duration::from_secs(61);
        let actions = pool.reconcile(later, &tracker);

        assert_eq!(pool.get(&keys[0]).unwrap().state, InstanceState::Dead);
        assert_eq!(destroys(&actions), vec![keys[0]]);
        assert_eq!(creates(&actions).len(), 1);
    }

    #[test]
    fn test_health_threshold_retires_then_destroys_after_drain() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, keys) = ready_pool(now, &tracker);
        let victim = keys[0];

        tracker.acquire(victim);

        for i in 0..4 {
            pool.apply(
                Event::Probed {
                    key: victim,
                    outcome: ProbeOutcome::Unhealthy("refused".into()),
                },
                now,
            );
            assert_eq!(pool.get(&victim).unwrap().failure_count, i + 1);
            assert_eq!(pool.get(&victim).unwrap().state, InstanceState::Ready);
        }
        pool.apply(
            Event::Probed {
                key: victim,
                outcome: ProbeOutcome::Unhealthy("refused".into()),
            },
            now,
        );
        assert_eq!(pool.get(&victim).unwrap().state, InstanceState::Retiring);
        assert!(pool.routable().iter().all(|b| b.key != victim));

        // Exactly one replacement; no destroy while a connection is open.
        let actions = pool.reconcile(now, &tracker);
        assert_eq!(creates(&actions).len(), 1);
        assert!(destroys(&actions).is_empty());

        tracker.release(victim);
        let actions = pool.reconcile(now + Duration::from_secs(1), &tracker);
        assert_eq!(destroys(&actions), vec![victim]);
        assert!(creates(&actions).is_empty());

        pool.apply(
            Event::Destroyed {
                key: victim,
                result: Ok(()),
            },
            now,
        );
        assert!(pool.get(&victim).is_none());
    }

    #[test]
    fn test_successful_probe_resets_failures() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, keys) = ready_pool(now, &tracker);

        for _ in 0..3 {
            pool.apply(
                Event::Probed {
                    key: keys[0],
                    outcome: ProbeOutcome::Unhealthy("timeout".into()),
                },
                now,
            );
        }
        pool.apply(
            Event::Probed {
                key: keys[0],
                outcome: ProbeOutcome::Healthy {
                    latency: Duration::from_millis(3),
                },
            },
            now,
        );

        let instance = pool.get(&keys[0]).unwrap();
        assert_eq!(instance.failure_count, 0);
        assert_eq!(instance.state, InstanceState::Ready);
    }

    #[test]
    fn test_retiring_destroyed_after_grace_even_with_connections() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let mut config = settings();
        config.max_lifetime = Some(Duration::from_secs(100));
        let mut pool = Pool::new(config);
        let keys = creates(&pool.reconcile(now, &tracker));
        for (n, key) in keys.iter().enumerate() {
            make_ready(&mut pool, *key, n + 1, now);
        }
        tracker.acquire(keys[0]);
        tracker.acquire(keys[1]);

        let expiry = now + Duration::from_secs(100);
        pool.reconcile(expiry, &tracker);
        assert_eq!(pool.get(&keys[0]).unwrap().state, InstanceState::Retiring);
        assert_eq!(
            pool.get(&keys[0]).unwrap().last_transition,
            Transition::LifetimeExpired
        );
        assert!(pool.routable().is_empty());

        let actions = pool.reconcile(expiry + Duration::from_secs(30), &tracker);
        let mut destroyed = destroys(&actions);
        destroyed.sort();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(destroyed, expected);
        assert_eq!(
            pool.get(&keys[0]).unwrap().last_transition,
            Transition::GraceElapsed
        );
    }

    #[test]
    fn test_destroy_retries_then_gives_up() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, keys) = ready_pool(now, &tracker);
        let victim = keys[0];

        for _ in 0..5 {
            pool.apply(
                Event::Probed {
                    key: victim,
                    outcome: ProbeOutcome::Unhealthy("down".into()),
                },
                now,
            );
        }

        let mut t = now;
        for attempt in 1..=3u32 {
            t += Duration::from_secs(60);
            let actions = pool.reconcile(t, &tracker);
            assert_eq!(destroys(&actions), vec![victim], "attempt {}", attempt);
            pool.apply(
                Event::Destroyed {
                    key: victim,
                    result: Err(ProviderError::Api("busy".into())),
                },
                t,
            );
        }

        // Budget of 3 exhausted: record dropped regardless.
        assert!(pool.get(&victim).is_none());
        assert!(pool.routable().iter().all(|b| b.key != victim));
    }

    #[test]
    fn test_destroy_not_found_counts_as_success() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, keys) = ready_pool(now, &tracker);

        pool.set_desired(2);
        pool.apply(
            Event::Status {
                key: keys[0],
                result: Err(ProviderError::NotFound("i-1".into())),
            },
            now,
        );
        // Status results only matter while booting.
        assert_eq!(pool.get(&keys[0]).unwrap().state, InstanceState::Ready);

        for _ in 0..5 {
            pool.apply(
                Event::Probed {
                    key: keys[0],
                    outcome: ProbeOutcome::Unhealthy("down".into()),
                },
                now,
            );
        }
        pool.reconcile(now, &tracker);
        pool.apply(
            Event::Destroyed {
                key: keys[0],
                result: Err(ProviderError::NotFound("i-1".into())),
            },
            now,
        );
        assert!(pool.get(&keys[0]).is_none());

        // A second destroy result for the same record is a no-op.
        let follow = pool.apply(
            Event::Destroyed {
                key: keys[0],
                result: Ok(()),
            },
            now,
        );
        assert!(follow.is_empty());
    }

    #[test]
    fn test_scale_down_retires_oldest_ready() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let mut pool = Pool::new(settings());
        pool.set_desired(4);

        let keys = creates(&pool.reconcile(now, &tracker));
        assert_eq!(keys.len(), 4);
        for (n, key) in keys.iter().enumerate() {
            make_ready(&mut pool, *key, n + 1, now);
        }

        assert_eq!(pool.set_desired(0), 2);
        pool.reconcile(now + Duration::from_secs(1), &tracker);

        let counts = pool.counts();
        assert_eq!(counts.ready, 2);
        // Idle retiring instances drain immediately on the next pass.
        assert_eq!(counts.retiring + counts.dead, 2);
        assert_eq!(pool.routable().len(), 2);
    }

    #[test]
    fn test_scale_down_cancels_outstanding_creates_first() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, ready) = ready_pool(now, &tracker);

        pool.set_desired(4);
        let pending = creates(&pool.reconcile(now, &tracker));
        assert_eq!(pending.len(), 2);

        pool.set_desired(2);
        let actions = pool.reconcile(now + Duration::from_secs(1), &tracker);
        assert!(destroys(&actions).is_empty());

        let counts = pool.counts();
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.retiring, 0);
        assert_eq!(counts.dead, 2);
        let routable: Vec<InstanceKey> = pool.routable().iter().map(|b| b.key).collect();
        assert_eq!(routable.len(), 2);
        assert!(ready.iter().all(|k| routable.contains(k)));

        // Kept until the provider answers, so the instance can still be torn down.
        assert_eq!(pool.pending_creates(), 2);
        let follow = pool.apply(
            Event::Created {
                key: pending[0],
                result: Ok("i-late".to_string()),
            },
            now + Duration::from_secs(2),
        );
        assert!(matches!(
            follow.as_slice(),
            [Action::Destroy { provider_id, .. }] if provider_id == "i-late"
        ));

        let follow = pool.apply(
            Event::Created {
                key: pending[1],
                result: Err(ProviderError::Api("quota".into())),
            },
            now + Duration::from_secs(2),
        );
        assert!(follow.is_empty());
        assert!(pool.get(&pending[1]).is_none());
        assert_eq!(pool.pending_creates(), 0);

        pool.apply(
            Event::Destroyed {
                key: pending[0],
                result: Ok(()),
            },
            now + Duration::from_secs(3),
        );
        assert!(pool.get(&pending[0]).is_none());
        assert_eq!(pool.counts().ready, 2);
    }

    #[test]
    fn test_creation_never_exceeds_max() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let mut config = settings();
        config.min = 2;
        config.max = 2;
        let mut pool = Pool::new(config);

        let keys = creates(&pool.reconcile(now, &tracker));
        for (n, key) in keys.iter().enumerate() {
            make_ready(&mut pool, *key, n + 1, now);
        }

        tracker.acquire(keys[0]);
        for _ in 0..5 {
            pool.apply(
                Event::Probed {
                    key: keys[0],
                    outcome: ProbeOutcome::Unhealthy("down".into()),
                },
                now,
            );
        }

        // Retiring instance still occupies a slot under max.
        let actions = pool.reconcile(now, &tracker);
        assert!(creates(&actions).is_empty());
        assert_eq!(pool.live(), 2);

        // Once it is dead the slot frees up, destroy still pending.
        tracker.release(keys[0]);
        let actions = pool.reconcile(now, &tracker);
        assert_eq!(destroys(&actions), vec![keys[0]]);
        assert_eq!(creates(&actions).len(), 1);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn test_late_events_are_ignored() {
        let tracker = ConnectionTracker::new();
        let mut pool = Pool::new(settings());
        let now = Instant::now();
        pool.reconcile(now, &tracker);

        let stranger = InstanceKey::new();
        let follow = pool.apply(
            Event::Created {
                key: stranger,
                result: Ok("i-ghost".into()),
            },
            now,
        );
        assert!(follow.is_empty());
        assert!(pool.get(&stranger).is_none());
    }

    #[test]
    fn test_shutdown_empties_routing_and_targets_everything() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();
        let (mut pool, keys) = ready_pool(now, &tracker);

        pool.begin_shutdown();
        assert!(pool.routable().is_empty());
        assert!(creates(&pool.reconcile(now, &tracker)).is_empty());

        let mut targets: Vec<InstanceKey> = pool
            .drain_for_shutdown(now)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        targets.sort();
        let mut expected = keys;
        expected.sort();
        assert_eq!(targets, expected);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_bare_host_gets_instance_port() {
        assert_eq!(with_default_port("10.1.2.3".into(), 3128), "10.1.2.3:3128");
        assert_eq!(with_default_port("10.1.2.3:8080".into(), 3128), "10.1.2.3:8080");
        assert_eq!(with_default_port("::1".into(), 3128), "[::1]:3128");
        assert_eq!(with_default_port("proxy.internal".into(), 3128), "proxy.internal:3128");
        assert_eq!(with_default_port("proxy.internal:9000".into(), 3128), "proxy.internal:9000");
    }

    #[test]
    fn test_adopt_skips_known_instances() {
        let mut pool = Pool::new(settings());
        let now = Instant::now();
        pool.adopt(vec!["i-1".into(), "i-2".into()], now);
        pool.adopt(vec!["i-2".into()], now);

        assert_eq!(pool.counts().booting, 2);
        assert_eq!(pool.capacity(), 2);

        let tracker = ConnectionTracker::new();
        let actions = pool.reconcile(now, &tracker);
        let polls = actions
            .iter()
            .filter(|a| matches!(a, Action::PollStatus { .. }))
            .count();
        assert_eq!(polls, 2);
        assert!(creates(&actions).is_empty());
    }
}
