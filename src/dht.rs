use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId, kad};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    nat::NatStats,
    traits::ProviderDirectory,
    types::{NamespaceError, NamespaceKey},
};

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("swarm event loop is not running")]
    LoopClosed,
    #[error("local record store rejected the provider record: {0}")]
    Store(String),
    #[error("routing table has no known peers")]
    NoKnownPeers,
    #[error("DHT query failed: {0}")]
    Query(String),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

/// Requests executed by the task that owns the swarm.
#[derive(Debug)]
pub enum SwarmCommand {
    Dial {
        addr: Multiaddr,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Bootstrap {
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    StartProviding {
        key: kad::RecordKey,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    GetProviders {
        key: kad::RecordKey,
        limit: usize,
        providers: mpsc::Sender<PeerId>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ConnectionStats {
        reply: oneshot::Sender<NatStats>,
    },
}

/// Cloneable handle onto the swarm task; the swarm itself is never shared.
#[derive(Debug, Clone)]
pub struct DhtHandle {
    commands: mpsc::Sender<SwarmCommand>,
}

impl DhtHandle {
    pub fn new(commands: mpsc::Sender<SwarmCommand>) -> Self {
        Self { commands }
    }

    async fn send(&self, command: SwarmCommand) -> Result<(), DhtError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DhtError::LoopClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand,
    ) -> Result<T, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| DhtError::LoopClosed)
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<(), DhtError> {
        self.send(SwarmCommand::Dial { addr }).await
    }

    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<(), DhtError> {
        self.send(SwarmCommand::AddAddress { peer, addr }).await
    }

    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        self.request(|reply| SwarmCommand::Bootstrap { reply }).await?
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, DhtError> {
        self.request(|reply| SwarmCommand::ConnectedPeers { reply }).await
    }

    pub async fn connection_stats(&self) -> Result<NatStats, DhtError> {
        self.request(|reply| SwarmCommand::ConnectionStats { reply }).await
    }
}

#[async_trait]
impl ProviderDirectory for DhtHandle {
    async fn provide(&self, key: &NamespaceKey) -> Result<(), DhtError> {
        let record_key = key.to_record_key();
        self.request(|reply| SwarmCommand::StartProviding {
            key: record_key,
            reply,
        })
        .await?
    }

    async fn find_providers(
        &self,
        key: &NamespaceKey,
        limit: usize,
    ) -> Result<mpsc::Receiver<PeerId>, DhtError> {
        let (providers, rx) = mpsc::channel(limit.max(1));
        self.send(SwarmCommand::GetProviders {
            key: key.to_record_key(),
            limit,
            providers,
        })
        .await?;
        Ok(rx)
    }
}
