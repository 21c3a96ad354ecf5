use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use libp2p::PeerId;

use super::backoff::RetryBackoff;
use crate::{config::PeerHealthConfig, traits::MealyMachine, types::Resource};

// ─── State types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PeerState {
    Healthy,
    Unhealthy,
    /// Tombstone: the peer may not re-enter until `next_retry_at`.
    RecentlyRemoved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub metadata: Option<Arc<Resource>>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_health_check: Instant,
    pub consecutive_failures: u32,
    /// Next probe for live peers; end of the cooldown for tombstones.
    pub next_retry_at: Instant,
    pub state: PeerState,
}

impl PeerInfo {
    fn admitted(peer_id: PeerId, resource: Arc<Resource>, now: Instant) -> Self {
        Self {
            peer_id,
            metadata: Some(resource),
            first_seen: now,
            last_seen: now,
            last_health_check: now,
            consecutive_failures: 0,
            next_retry_at: now,
            state: PeerState::Healthy,
        }
    }

    fn tombstone(peer_id: PeerId, now: Instant, cooldown: Duration) -> Self {
        Self {
            peer_id,
            metadata: None,
            first_seen: now,
            last_seen: now,
            last_health_check: now,
            consecutive_failures: 0,
            next_retry_at: now + cooldown,
            state: PeerState::RecentlyRemoved,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, PeerState::Healthy | PeerState::Unhealthy)
    }

    /// Metadata is only reported while it is younger than `max_age`.
    pub fn fresh_metadata(&self, max_age: Duration, now: DateTime<Utc>) -> Option<Arc<Resource>> {
        self.metadata
            .as_ref()
            .filter(|m| m.is_fresh(max_age, now))
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RemovalReason {
    Disconnected,
    DiscoveryFailed,
    RetriesExhausted,
    Stale,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A discovery pass fetched a valid descriptor. May admit an unknown peer.
    Discovered {
        peer: PeerId,
        resource: Arc<Resource>,
        now: Instant,
    },
    /// A health or refresh probe succeeded. Never admits a peer.
    ProbeSucceeded {
        peer: PeerId,
        resource: Arc<Resource>,
        now: Instant,
    },
    ProbeFailed {
        peer: PeerId,
        now: Instant,
    },
    Removed {
        peer: PeerId,
        reason: RemovalReason,
        now: Instant,
    },
    Sweep {
        now: Instant,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Admitted {
        peer: PeerId,
    },
    Refreshed {
        peer: PeerId,
    },
    Recovered {
        peer: PeerId,
    },
    Degraded {
        peer: PeerId,
        failures: u32,
        retry_in: Duration,
    },
    Evicted {
        peer: PeerId,
        reason: RemovalReason,
    },
    Forgotten {
        peer: PeerId,
    },
    /// A success arrived for a peer that is tombstoned or no longer tracked.
    Suppressed {
        peer: PeerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryPolicy {
    pub backoff: RetryBackoff,
    pub max_failed_attempts: u32,
    pub stale_peer_timeout: Duration,
    pub removal_cooldown: Duration,
}

impl From<&PeerHealthConfig> for RegistryPolicy {
    fn from(config: &PeerHealthConfig) -> Self {
        Self {
            backoff: RetryBackoff::from_config(config),
            max_failed_attempts: config.max_failed_attempts,
            stale_peer_timeout: config.stale_peer_timeout,
            removal_cooldown: config.removal_cooldown,
        }
    }
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self::from(&PeerHealthConfig::default())
    }
}

/// Canonical peer table. One entry per peer; tombstones live in the same map
/// so a peer can never be both healthy and recently removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerRegistry {
    policy: RegistryPolicy,
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            policy,
            peers: HashMap::new(),
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<PeerState> {
        self.peers.get(peer).map(|info| info.state)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Unhealthy and tombstoned peers both count; discovery skips either.
    pub fn is_unhealthy(&self, peer: &PeerId) -> bool {
        matches!(
            self.state_of(peer),
            Some(PeerState::Unhealthy | PeerState::RecentlyRemoved)
        )
    }

    /// Owned copies of every healthy entry with stale metadata blanked out.
    pub fn healthy_snapshot(
        &self,
        max_metadata_age: Duration,
        now: DateTime<Utc>,
    ) -> HashMap<PeerId, PeerInfo> {
        self.peers
            .iter()
            .filter(|(_, info)| info.state == PeerState::Healthy)
            .map(|(peer, info)| {
                let snapshot = PeerInfo {
                    metadata: info.fresh_metadata(max_metadata_age, now),
                    ..info.clone()
                };
                (*peer, snapshot)
            })
            .collect()
    }

    /// Live peers whose retry time has passed.
    pub fn due_for_probe(&self, now: Instant) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|info| info.is_active() && info.next_retry_at <= now)
            .map(|info| info.peer_id)
            .collect()
    }

    /// Healthy peers whose descriptor is missing or at least `refresh_after` old.
    pub fn due_for_refresh(&self, refresh_after: Duration, now: DateTime<Utc>) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|info| info.state == PeerState::Healthy)
            .filter(|info| match (&info.metadata, TimeDelta::from_std(refresh_after)) {
                (Some(m), Ok(refresh_after)) => m.age(now) >= refresh_after,
                (Some(_), Err(_)) => false,
                (None, _) => true,
            })
            .map(|info| info.peer_id)
            .collect()
    }

    fn record_success(&mut self, peer: PeerId, resource: Arc<Resource>, now: Instant) -> RegistryChange {
        match self.peers.get_mut(&peer) {
            Some(info) if info.is_active() => {
                let was = info.state;
                info.metadata = Some(resource);
                info.last_seen = now;
                info.last_health_check = now;
                info.consecutive_failures = 0;
                info.next_retry_at = now;
                info.state = PeerState::Healthy;
                match was {
                    PeerState::Unhealthy => RegistryChange::Recovered { peer },
                    PeerState::Healthy | PeerState::RecentlyRemoved => {
                        RegistryChange::Refreshed { peer }
                    }
                }
            }
            Some(_) | None => RegistryChange::Suppressed { peer },
        }
    }

    fn tombstone(&mut self, peer: PeerId, reason: RemovalReason, now: Instant) -> Vec<RegistryChange> {
        let cooldown = self.policy.removal_cooldown;
        match self.peers.get_mut(&peer) {
            Some(info) if info.state == PeerState::RecentlyRemoved => vec![],
            Some(info) => {
                info.state = PeerState::RecentlyRemoved;
                info.metadata = None;
                info.next_retry_at = now + cooldown;
                vec![RegistryChange::Evicted { peer, reason }]
            }
            None => {
                self.peers
                    .insert(peer, PeerInfo::tombstone(peer, now, cooldown));
                vec![]
            }
        }
    }

    fn record_failure(&mut self, peer: PeerId, now: Instant) -> Vec<RegistryChange> {
        let policy = self.policy;
        let failures = match self.peers.get_mut(&peer) {
            Some(info) if info.is_active() => {
                info.consecutive_failures = info.consecutive_failures.saturating_add(1);
                info.last_health_check = now;
                info.consecutive_failures
            }
            Some(_) | None => return vec![],
        };

        match failures >= policy.max_failed_attempts {
            true => self.tombstone(peer, RemovalReason::RetriesExhausted, now),
            false => {
                let retry_in = policy.backoff.delay(failures);
                if let Some(info) = self.peers.get_mut(&peer) {
                    info.state = PeerState::Unhealthy;
                    info.next_retry_at = now + retry_in;
                }
                vec![RegistryChange::Degraded {
                    peer,
                    failures,
                    retry_in,
                }]
            }
        }
    }

    fn sweep(&mut self, now: Instant) -> Vec<RegistryChange> {
        let stale_timeout = self.policy.stale_peer_timeout;
        let mut changes = Vec::new();

        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|info| info.state == PeerState::RecentlyRemoved && info.next_retry_at <= now)
            .map(|info| info.peer_id)
            .collect();
        for peer in expired {
            self.peers.remove(&peer);
            changes.push(RegistryChange::Forgotten { peer });
        }

        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|info| {
                info.is_active() && now.saturating_duration_since(info.last_seen) > stale_timeout
            })
            .map(|info| info.peer_id)
            .collect();
        for peer in stale {
            changes.extend(self.tombstone(peer, RemovalReason::Stale, now));
        }

        changes
    }
}

impl MealyMachine for PeerRegistry {
    type Event = RegistryEvent;
    type Output = RegistryChange;

    fn transition(mut self, event: RegistryEvent) -> (Self, Vec<RegistryChange>) {
        let changes = match event {
            RegistryEvent::Discovered {
                peer,
                resource,
                now,
            } => match self.peers.contains_key(&peer) {
                true => vec![self.record_success(peer, resource, now)],
                false => {
                    self.peers
                        .insert(peer, PeerInfo::admitted(peer, resource, now));
                    vec![RegistryChange::Admitted { peer }]
                }
            },

            RegistryEvent::ProbeSucceeded {
                peer,
                resource,
                now,
            } => vec![self.record_success(peer, resource, now)],

            RegistryEvent::ProbeFailed { peer, now } => self.record_failure(peer, now),

            RegistryEvent::Removed { peer, reason, now } => self.tombstone(peer, reason, now),

            RegistryEvent::Sweep { now } => self.sweep(now),
        };

        (self, changes)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
