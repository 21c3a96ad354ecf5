use crate::{dht::DhtError, traits::ProviderDirectory, types::NamespaceKey};

/// Announce this node as a provider of the peer namespace.
///
/// Provider records expire inside the DHT, so callers repeat this on a timer.
/// The key is rederived on every call.
pub async fn advertise(directory: &dyn ProviderDirectory) -> Result<(), DhtError> {
    let key = NamespaceKey::peers()?;
    directory.provide(&key).await?;
    tracing::debug!(namespace = %key, "advertised namespace");
    Ok(())
}
