use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Local identity of an instance record
///
/// Assigned when the record is created, before the provider has handed out an
/// id, and stable for the record's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey(Uuid);

impl InstanceKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// `create_instance` issued, no provider id yet
    Requested,
    /// Provider accepted the instance; waiting for it to run and get an address
    Booting,
    /// Running with an address; waiting for the proxy process to answer
    Starting,
    /// Serving traffic
    Ready,
    /// Out of the routing table, draining in-flight connections
    Retiring,
    /// Written off; being destroyed
    Dead,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Booting => "booting",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Retiring => "retiring",
            InstanceState::Dead => "dead",
        }
    }

    /// Serving, or on its way to serving
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            InstanceState::Requested
                | InstanceState::Booting
                | InstanceState::Starting
                | InstanceState::Ready
        )
    }

    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            InstanceState::Requested | InstanceState::Booting | InstanceState::Starting
        )
    }

    pub fn is_live(&self) -> bool {
        *self != InstanceState::Dead
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single named event behind a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Adopted,
    AddressAssigned,
    ProbePassed,
    ProvisioningTimeout,
    ProviderTerminated,
    LifetimeExpired,
    HealthThreshold,
    ScaledDown,
    Drained,
    GraceElapsed,
    Shutdown,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Created => "created",
            Transition::Adopted => "adopted",
            Transition::AddressAssigned => "address_assigned",
            Transition::ProbePassed => "probe_passed",
            Transition::ProvisioningTimeout => "provisioning_timeout",
            Transition::ProviderTerminated => "provider_terminated",
            Transition::LifetimeExpired => "lifetime_expired",
            Transition::HealthThreshold => "health_threshold",
            Transition::ScaledDown => "scaled_down",
            Transition::Drained => "drained",
            Transition::GraceElapsed => "grace_elapsed",
            Transition::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One cloud-provisioned proxy backend, owned by the pool
#[derive(Debug, Clone)]
pub struct Instance {
    pub key: InstanceKey,
    /// Provider-assigned id, known once `create_instance` returns
    pub provider_id: Option<String>,
    pub state: InstanceState,
    /// `host:port`, known once booting completes
    pub address: Option<String>,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    pub last_healthy_at: Option<Instant>,
    /// Consecutive failed health probes
    pub failure_count: u32,
    /// When the current state was entered
    pub state_since: Instant,
    pub last_transition: Transition,
    pub last_probe_at: Option<Instant>,
    /// A provider call or probe for this instance is outstanding
    pub in_flight: bool,
    /// A `destroy_instance` call is outstanding
    pub destroying: bool,
    pub destroy_attempts: u32,
    /// Earliest time the next destroy attempt may run
    pub retry_at: Option<Instant>,
}

impl Instance {
    /// Record for a `create_instance` call about to be issued
    pub fn requested(now: Instant) -> Self {
        Self {
            key: InstanceKey::new(),
            provider_id: None,
            state: InstanceState::Requested,
            address: None,
            created_at: now,
            created_at_utc: Utc::now(),
            last_healthy_at: None,
            failure_count: 0,
            state_since: now,
            last_transition: Transition::Created,
            last_probe_at: None,
            in_flight: false,
            destroying: false,
            destroy_attempts: 0,
            retry_at: None,
        }
    }

    /// Record for an instance found already running at the provider
    pub fn adopted(provider_id: String, now: Instant) -> Self {
        let mut instance = Self::requested(now);
        instance.provider_id = Some(provider_id);
        instance.state = InstanceState::Booting;
        instance.last_transition = Transition::Adopted;
        instance
    }

    /// The `create_instance` call for this record has not answered yet
    pub fn awaiting_create(&self) -> bool {
        self.provider_id.is_none() && self.in_flight
    }

    /// Move to `to`, recording the event that caused it
    pub fn transition(&mut self, to: InstanceState, cause: Transition, now: Instant) {
        info!(
            instance = %self.key,
            provider_id = self.provider_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %to,
            cause = %cause,
            "Instance transition"
        );
        self.state = to;
        self.state_since = now;
        self.last_transition = cause;
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            key: self.key,
            provider_id: self.provider_id.clone(),
            state: self.state,
            address: self.address.clone(),
            created_at: self.created_at_utc,
            failure_count: self.failure_count,
            last_transition: self.last_transition,
        }
    }
}

/// Read-only copy of an instance handed out to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub key: InstanceKey,
    pub provider_id: Option<String>,
    pub state: InstanceState,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failure_count: u32,
    pub last_transition: Transition,
}
