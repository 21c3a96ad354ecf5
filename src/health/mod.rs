//! Peer lifecycle: discovery feeds the registry, probes keep it honest,
//! disconnects and exhausted retries evict.
//!
//! All registry rules live in [`registry::PeerRegistry`]; this module only
//! owns the timers, the network collaborators, and the lock.

pub mod backoff;
pub mod registry;

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::Utc;
use libp2p::PeerId;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use self::registry::{
    PeerInfo, PeerRegistry, PeerState, RegistryChange, RegistryEvent, RegistryPolicy,
    RemovalReason,
};
use crate::{
    advertiser,
    config::Config,
    discovery::{DiscoveredPeer, Discoverer},
    metadata,
    traits::{MealyMachine, MetadataFetcher, PeerHealthView, ProviderDirectory},
    types::Resource,
};

/// Registry timestamps follow the tokio clock so paused-time tests drive them.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub healthy: usize,
    pub workers: usize,
    pub consumers: usize,
}

impl PeerStats {
    pub fn log(&self) {
        tracing::info!(
            total_peers = self.healthy,
            worker_peers = self.workers,
            consumer_peers = self.consumers,
            "peer statistics"
        );
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PeerHealthManager {
    config: Config,
    registry: Mutex<PeerRegistry>,
    discoverer: Discoverer,
    directory: Arc<dyn ProviderDirectory>,
    fetcher: Arc<dyn MetadataFetcher>,
    local: watch::Sender<Arc<Resource>>,
    running: Mutex<Option<Running>>,
}

impl PeerHealthManager {
    pub fn new(
        config: Config,
        directory: Arc<dyn ProviderDirectory>,
        fetcher: Arc<dyn MetadataFetcher>,
        local: watch::Sender<Arc<Resource>>,
    ) -> Self {
        let discoverer = Discoverer::new(directory.clone(), fetcher.clone(), &config);
        Self {
            registry: Mutex::new(PeerRegistry::new(RegistryPolicy::from(&config.peer_health))),
            config,
            discoverer,
            directory,
            fetcher,
            local,
            running: Mutex::new(None),
        }
    }

    fn registry(&self) -> MutexGuard<'_, PeerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, event: RegistryEvent) -> Vec<RegistryChange> {
        let changes = {
            let mut registry = self.registry();
            let (next, changes) = std::mem::take(&mut *registry).transition(event);
            *registry = next;
            changes
        };
        changes.iter().for_each(log_change);
        changes
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Launch the discover, advertise, metadata-refresh and health-check loops.
    /// Returns `false` when they are already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let health_check_interval = self.config.peer_health.health_check_interval;
        let tasks = vec![
            self.spawn_loop("discover", self.config.discovery_interval, &cancel, |m| async move {
                m.discover_once().await
            }),
            self.spawn_loop("advertise", self.config.advertising_interval, &cancel, |m| async move {
                m.advertise_once().await
            }),
            self.spawn_loop(
                "metadata-refresh",
                self.config.metadata_update_interval,
                &cancel,
                |m| async move { m.refresh_metadata_once().await },
            ),
            self.spawn_loop("health-check", health_check_interval, &cancel, |m| async move {
                m.check_health_once().await
            }),
        ];

        *running = Some(Running { cancel, tasks });
        tracing::info!("peer health manager started");
        true
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        cancel: &CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick(manager.clone()) => {}
                }
            }
            tracing::debug!(loop_name = name, "loop stopped");
        })
    }

    /// Cancel every loop and wait until all of them have exited.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, tasks }) = running else {
            return;
        };

        cancel.cancel();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "peer health loop panicked");
            }
        }
        tracing::info!("peer health manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ─── Loop bodies ────────────────────────────────────────────────────────

    pub async fn discover_once(&self) {
        let found = match self.discoverer.discover_peers(self).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "peer discovery failed");
                return;
            }
        };
        for DiscoveredPeer { peer, resource } in found {
            self.apply(RegistryEvent::Discovered {
                peer,
                resource,
                now: now(),
            });
        }
    }

    pub async fn advertise_once(&self) {
        if let Err(e) = advertiser::advertise(self.directory.as_ref()).await {
            tracing::warn!(error = %e, "advertising failed");
        }
    }

    /// Re-stamp the local descriptor, then refetch healthy peers whose
    /// metadata is at least one refresh interval old.
    pub async fn refresh_metadata_once(&self) {
        self.local
            .send_modify(|resource| *resource = Arc::new(resource.restamped(Utc::now())));

        let due = self
            .registry()
            .due_for_refresh(self.config.metadata_update_interval, Utc::now());
        self.probe_all(due).await;
    }

    /// Probe every live peer whose retry time has passed, then sweep stale
    /// entries and expired tombstones.
    pub async fn check_health_once(&self) {
        let due = self.registry().due_for_probe(now());
        self.probe_all(due).await;
        self.apply(RegistryEvent::Sweep { now: now() });
    }

    async fn probe_all(&self, peers: Vec<PeerId>) {
        futures::future::join_all(peers.into_iter().map(|peer| self.probe(peer))).await;
    }

    async fn probe(&self, peer: PeerId) {
        let health = &self.config.peer_health;
        let result = metadata::fetch_fresh(
            self.fetcher.as_ref(),
            peer,
            health.metadata_timeout,
            health.max_metadata_age,
        )
        .await;

        let event = match result {
            Ok(resource) => RegistryEvent::ProbeSucceeded {
                peer,
                resource: Arc::new(resource),
                now: now(),
            },
            Err(e) => {
                tracing::debug!(%peer, error = %e, "health probe failed");
                RegistryEvent::ProbeFailed { peer, now: now() }
            }
        };
        self.apply(event);
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    /// Snapshot of every healthy peer; metadata past its maximum age is absent.
    pub fn get_healthy_peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.registry()
            .healthy_snapshot(self.config.peer_health.max_metadata_age, Utc::now())
    }

    pub fn peer_info(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.registry().get(peer).cloned()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        self.registry().state_of(peer)
    }

    pub fn peer_stats(&self) -> PeerStats {
        let healthy = self.get_healthy_peers();
        let workers = healthy
            .values()
            .filter(|info| info.metadata.as_ref().is_some_and(|m| m.worker_mode))
            .count();
        PeerStats {
            healthy: healthy.len(),
            workers,
            consumers: healthy.len().saturating_sub(workers),
        }
    }

    pub fn local_resource(&self) -> Arc<Resource> {
        self.local.borrow().clone()
    }

    /// Replace the descriptor served to other peers.
    pub fn set_local_resource(&self, resource: Resource) {
        self.local.send_replace(Arc::new(resource));
    }

    // ─── Mutations ──────────────────────────────────────────────────────────

    /// Drop a peer immediately after its last connection closed. Idempotent.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.apply(RegistryEvent::Removed {
            peer: *peer,
            reason: RemovalReason::Disconnected,
            now: now(),
        });
    }
}

impl PeerHealthView for PeerHealthManager {
    fn is_peer_unhealthy(&self, peer: &PeerId) -> bool {
        self.registry().is_unhealthy(peer)
    }

    fn mark_peer_as_recently_removed(&self, peer: &PeerId) {
        self.apply(RegistryEvent::Removed {
            peer: *peer,
            reason: RemovalReason::DiscoveryFailed,
            now: now(),
        });
    }
}

fn log_change(change: &RegistryChange) {
    match change {
        RegistryChange::Admitted { peer } => tracing::info!(%peer, "peer admitted"),
        RegistryChange::Refreshed { peer } => tracing::debug!(%peer, "peer metadata refreshed"),
        RegistryChange::Recovered { peer } => tracing::info!(%peer, "peer recovered"),
        RegistryChange::Degraded {
            peer,
            failures,
            retry_in,
        } => tracing::debug!(
            %peer,
            failures = *failures,
            retry_in_secs = retry_in.as_secs(),
            "peer marked unhealthy"
        ),
        RegistryChange::Evicted { peer, reason } => tracing::info!(%peer, %reason, "peer removed"),
        RegistryChange::Forgotten { peer } => tracing::debug!(%peer, "removal cooldown expired"),
        RegistryChange::Suppressed { peer } => {
            tracing::debug!(%peer, "ignoring result for removed peer")
        }
    }
}
