use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use thiserror::Error;

/// Seed used when the caller supplies none.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] =
    &["/ip4/127.0.0.1/tcp/9000/p2p/12D3KooWLLUBEZhkEq6NtTLD99RRpEYdcbe8uzx3L56UgF5VK4bw"];

#[derive(Debug, Error)]
pub enum BootstrapAddrError {
    #[error("invalid bootstrap address '{addr}': {source}")]
    Parse {
        addr: String,
        source: libp2p::multiaddr::Error,
    },
    #[error("bootstrap address {0} has no /p2p/ component")]
    MissingPeerId(Multiaddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub peer: PeerId,
    pub addr: Multiaddr,
}

pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

pub fn parse_seed(raw: &str) -> Result<Seed, BootstrapAddrError> {
    let addr: Multiaddr = raw.trim().parse().map_err(|source| BootstrapAddrError::Parse {
        addr: raw.to_string(),
        source,
    })?;
    match peer_id_of(&addr) {
        Some(peer) => Ok(Seed { peer, addr }),
        None => Err(BootstrapAddrError::MissingPeerId(addr)),
    }
}

fn parse_all<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<Seed> {
    raw.into_iter()
        .filter_map(|s| match parse_seed(s) {
            Ok(seed) => Some(seed),
            Err(e) => {
                tracing::warn!(error = %e, "skipping bootstrap address");
                None
            }
        })
        .collect()
}

/// Custom seeds, or the built-in default when none of them parse.
///
/// Only peers speaking the crowdnode Kademlia protocol can fill the routing
/// table, so there is no fallback to the public IPFS bootstrap set.
pub fn resolve_seeds(custom: &[String]) -> Vec<Seed> {
    let custom = parse_all(custom.iter().map(String::as_str));
    match custom.is_empty() {
        false => custom,
        true => {
            tracing::info!("using default bootstrap peers");
            parse_all(DEFAULT_BOOTSTRAP_PEERS.iter().copied())
        }
    }
}
