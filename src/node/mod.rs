pub mod bootstrap;
mod event_loop;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result, anyhow, bail};
use libp2p::{
    Multiaddr, PeerId, SwarmBuilder, identity::Keypair, multiaddr::Protocol, noise, tcp, yamux,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use self::event_loop::EventLoop;
use crate::{
    behaviour::Behaviour,
    config::Config,
    dht::{DhtHandle, SwarmCommand},
    health::{PeerHealthManager, registry::PeerInfo},
    metadata::{self, StreamFetcher},
    nat::NatStats,
    protocol::{self, IDLE_CONNECTION_TIMEOUT, LISTEN_ADDR_WAIT},
    traits::ProviderDirectory,
    types::{NamespaceKey, Resource},
};

pub const DEFAULT_LISTEN_ADDRS: &[&str] = &["/ip4/0.0.0.0/tcp/9000", "/ip4/0.0.0.0/udp/9000/quic-v1"];

const COMMAND_BUFFER: usize = 64;
const CHECK_PROVIDER_LIMIT: usize = 20;

enum Lifecycle {
    Idle,
    Running {
        cancel: CancellationToken,
        stats: JoinHandle<()>,
    },
    Stopped,
}

/// A mesh node: host, DHT, metadata responder and the peer health manager.
pub struct Server {
    peer_id: PeerId,
    config: Config,
    dht: DhtHandle,
    health: Arc<PeerHealthManager>,
    listen_addrs: watch::Receiver<Vec<Multiaddr>>,
    swarm_cancel: CancellationToken,
    swarm_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    /// Build the host and start listening. Must be called inside a tokio runtime.
    ///
    /// Falls back to [`DEFAULT_LISTEN_ADDRS`] when `listen_addrs` is empty.
    pub fn new(
        keypair: Keypair,
        listen_addrs: Vec<Multiaddr>,
        config: Config,
        local: Resource,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let peer_id = keypair.public().to_peer_id();

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .context("building TCP transport")?
            .with_quic()
            .with_dns()
            .context("building DNS transport")?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .context("building relay client transport")?
            .with_behaviour(|key, relay_client| Behaviour::new(key, relay_client))
            .context("building network behaviour")?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let listen_addrs = match listen_addrs.is_empty() {
            true => default_listen_addrs()?,
            false => listen_addrs,
        };
        for addr in listen_addrs {
            swarm
                .listen_on(addr.clone())
                .with_context(|| format!("listening on {addr}"))?;
        }

        let mut control = swarm.behaviour().stream.new_control();
        let incoming = control
            .accept(protocol::metadata_protocol())
            .map_err(|_| anyhow!("metadata protocol already registered"))?;
        let (local_tx, local_rx) = watch::channel(Arc::new(local.with_peer_id(&peer_id)));
        tokio::spawn(metadata::serve(incoming, local_rx));

        let (command_tx, command_rx) = mpsc::channel::<SwarmCommand>(COMMAND_BUFFER);
        let dht = DhtHandle::new(command_tx);
        let health = Arc::new(PeerHealthManager::new(
            config.clone(),
            Arc::new(dht.clone()),
            Arc::new(StreamFetcher::new(control)),
            local_tx,
        ));

        let (addr_tx, addr_rx) = watch::channel(Vec::new());
        let swarm_cancel = CancellationToken::new();
        let swarm_task = tokio::spawn(
            EventLoop::new(swarm, command_rx, health.clone(), addr_tx).run(swarm_cancel.clone()),
        );

        tracing::info!(%peer_id, "node created");
        Ok(Self {
            peer_id,
            config,
            dht,
            health,
            listen_addrs: addr_rx,
            swarm_cancel,
            swarm_task: Mutex::new(Some(swarm_task)),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Dial the seed peers and bootstrap the routing table.
    ///
    /// Unparsable seeds and failed dials are logged and skipped. Seeding a
    /// node with its own address is allowed and leaves the table empty.
    pub async fn bootstrap(&self, seeds: &[String]) -> Result<()> {
        let seeds = bootstrap::resolve_seeds(seeds);
        for seed in &seeds {
            if seed.peer == self.peer_id {
                continue;
            }
            self.dht.add_address(seed.peer, seed.addr.clone()).await?;
            self.dht.dial(seed.addr.clone()).await?;
        }
        self.dht
            .bootstrap()
            .await
            .context("bootstrapping DHT routing table")?;
        tracing::info!(seeds = seeds.len(), "bootstrap started");
        Ok(())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Start background loops and return the primary address. Idempotent.
    pub async fn start(&self) -> Result<Multiaddr> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Stopped => bail!("server has been stopped"),
                Lifecycle::Running { .. } => {}
                Lifecycle::Idle => {
                    self.health.start();
                    let cancel = CancellationToken::new();
                    let stats = tokio::spawn(stats_loop(
                        self.dht.clone(),
                        self.health.clone(),
                        self.config.clone(),
                        cancel.clone(),
                    ));
                    *lifecycle = Lifecycle::Running { cancel, stats };
                    tracing::info!(peer_id = %self.peer_id, "node started");
                }
            }
        }
        self.wait_for_primary_addr().await
    }

    async fn wait_for_primary_addr(&self) -> Result<Multiaddr> {
        let mut addrs = self.listen_addrs.clone();
        let listening = async { addrs.wait_for(|a| !a.is_empty()).await.map(|_| ()) };
        match tokio::time::timeout(LISTEN_ADDR_WAIT, listening).await {
            Ok(Ok(())) => self
                .primary_addr()
                .ok_or_else(|| anyhow!("listen address disappeared")),
            Ok(Err(_)) => bail!("swarm loop exited before listening"),
            Err(_) => bail!("no listen address after {LISTEN_ADDR_WAIT:?}"),
        }
    }

    /// Stop all loops, then the swarm. Idempotent; no loop runs after this returns.
    pub async fn stop(&self) {
        let previous = std::mem::replace(
            &mut *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner),
            Lifecycle::Stopped,
        );
        if let Lifecycle::Running { cancel, stats } = previous {
            self.health.stop().await;
            cancel.cancel();
            if let Err(e) = stats.await {
                tracing::error!(error = %e, "stats loop panicked");
            }
        }

        self.swarm_cancel.cancel();
        let swarm_task = self
            .swarm_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = swarm_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "swarm loop panicked");
            }
            tracing::info!(peer_id = %self.peer_id, "node stopped");
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Every listen address with the `/p2p/<id>` suffix.
    pub fn peer_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .borrow()
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.peer_id)))
            .collect()
    }

    pub fn primary_addr(&self) -> Option<Multiaddr> {
        self.peer_addrs().into_iter().next()
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self.dht.connected_peers().await?)
    }

    pub async fn has_peer(&self, peer: &PeerId) -> Result<bool> {
        Ok(self.connected_peers().await?.contains(peer))
    }

    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.connected_peers().await?.len())
    }

    pub fn healthy_peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.health.get_healthy_peers()
    }

    pub fn health(&self) -> &Arc<PeerHealthManager> {
        &self.health
    }

    /// Whether `peer` currently shows up as a provider of `key`.
    pub async fn check_provider(&self, peer: &PeerId, key: &NamespaceKey) -> Result<bool> {
        let mut providers = self.dht.find_providers(key, CHECK_PROVIDER_LIMIT).await?;
        while let Some(provider) = providers.recv().await {
            if provider == *peer {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn nat_stats(&self) -> Result<NatStats> {
        Ok(self.dht.connection_stats().await?)
    }

    pub fn log_peer_stats(&self) {
        self.health.peer_stats().log();
    }
}

fn default_listen_addrs() -> Result<Vec<Multiaddr>> {
    DEFAULT_LISTEN_ADDRS
        .iter()
        .map(|s| {
            s.parse()
                .with_context(|| format!("parsing default listen address {s}"))
        })
        .collect()
}

async fn stats_loop(
    dht: DhtHandle,
    health: Arc<PeerHealthManager>,
    config: Config,
    cancel: CancellationToken,
) {
    let mut nat_tick = tokio::time::interval(config.nat_log_interval);
    let mut peer_tick = tokio::time::interval(config.stats_log_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = nat_tick.tick() => match dht.connection_stats().await {
                Ok(stats) => stats.log(),
                Err(e) => tracing::debug!(error = %e, "NAT statistics unavailable"),
            },
            _ = peer_tick.tick() => health.peer_stats().log(),
        }
    }
}
