use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::mpsc;

use crate::{
    dht::DhtError,
    metadata::MetadataError,
    types::{NamespaceKey, Resource},
};

/// A Mealy machine coalgebra: `(State, Event) → (State, Vec<Output>)`.
///
/// The peer registry implements this so every lifecycle rule can be
/// exercised without timers or sockets.
pub trait MealyMachine: Sized {
    type Event;
    type Output;
    fn transition(self, event: Self::Event) -> (Self, Vec<Self::Output>);
}

/// Provider-record side of the DHT.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn provide(&self, key: &NamespaceKey) -> Result<(), DhtError>;

    /// Lazily yields at most `limit` distinct providers, excluding the local node.
    /// The channel closes when the lookup finishes.
    async fn find_providers(
        &self,
        key: &NamespaceKey,
        limit: usize,
    ) -> Result<mpsc::Receiver<PeerId>, DhtError>;
}

/// Requester side of the metadata protocol.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, peer: PeerId, deadline: Duration) -> Result<Resource, MetadataError>;
}

/// The only view of the health manager the discoverer gets.
pub trait PeerHealthView: Send + Sync {
    fn is_peer_unhealthy(&self, peer: &PeerId) -> bool;
    fn mark_peer_as_recently_removed(&self, peer: &PeerId);
}
