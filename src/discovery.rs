use std::{sync::Arc, time::Duration};

use libp2p::PeerId;

use crate::{
    config::Config,
    dht::DhtError,
    metadata,
    traits::{MetadataFetcher, PeerHealthView, ProviderDirectory},
    types::{NamespaceKey, Resource},
};

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub peer: PeerId,
    pub resource: Arc<Resource>,
}

/// One-shot namespace lookup followed by a metadata fetch per candidate.
pub struct Discoverer {
    directory: Arc<dyn ProviderDirectory>,
    fetcher: Arc<dyn MetadataFetcher>,
    limit: usize,
    grace: Duration,
    timeout: Duration,
    max_age: Duration,
}

impl Discoverer {
    pub fn new(
        directory: Arc<dyn ProviderDirectory>,
        fetcher: Arc<dyn MetadataFetcher>,
        config: &Config,
    ) -> Self {
        Self {
            directory,
            fetcher,
            limit: config.discovery_limit,
            grace: config.discovery_grace,
            timeout: config.peer_health.metadata_timeout,
            max_age: config.peer_health.max_metadata_age,
        }
    }

    /// Returns every candidate that answered with a fresh descriptor.
    ///
    /// Per-candidate failures are reported to `health` and never fail the
    /// pass; only an unusable namespace or a rejected lookup does.
    pub async fn discover_peers(
        &self,
        health: &dyn PeerHealthView,
    ) -> Result<Vec<DiscoveredPeer>, DhtError> {
        let key = NamespaceKey::peers()?;
        let mut candidates = self.directory.find_providers(&key, self.limit).await?;

        let mut found = Vec::new();
        while let Some(peer) = candidates.recv().await {
            if health.is_peer_unhealthy(&peer) {
                tracing::debug!(%peer, "skipping unhealthy candidate");
                continue;
            }

            // Give the remote a moment to register its metadata handler.
            tokio::time::sleep(self.grace).await;

            let resource = match self.fetcher.fetch(peer, self.timeout).await {
                Ok(resource) => resource,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "metadata fetch failed");
                    health.mark_peer_as_recently_removed(&peer);
                    continue;
                }
            };

            match metadata::ensure_fresh(&resource, self.max_age) {
                Ok(()) => found.push(DiscoveredPeer {
                    peer,
                    resource: Arc::new(resource),
                }),
                Err(e) => tracing::debug!(%peer, error = %e, "discarding candidate"),
            }
        }

        tracing::debug!(namespace = %key, found = found.len(), "discovery pass complete");
        Ok(found)
    }
}
