use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use proptest::prelude::*;
use tokio::sync::{Notify, mpsc};

use crate::{
    dht::DhtError,
    metadata::MetadataError,
    traits::{MetadataFetcher, PeerHealthView, ProviderDirectory},
    types::{NamespaceKey, Resource},
};

// ─── Peer / address generators ──────────────────────────────────────────────

pub fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(|bytes| {
        // Infallible: any 32 bytes is a valid ed25519 seed
        let secret = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes)
            .expect("any 32 bytes is a valid ed25519 seed");
        let keypair = libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(secret));
        PeerId::from(keypair.public())
    })
}

pub fn arb_multiaddr() -> impl Strategy<Value = Multiaddr> {
    (1u8..=254, any::<u8>(), any::<u8>(), 1u8..=254, 1024u16..65535u16).prop_map(
        |(a, b, c, d, port)| {
            format!("/ip4/{a}.{b}.{c}.{d}/tcp/{port}")
                .parse()
                .expect("generated IP4/TCP multiaddr is always valid")
        },
    )
}

/// Globally routable IPv4 only; link-local and private ranges are excluded.
pub fn arb_public_multiaddr() -> impl Strategy<Value = Multiaddr> {
    (1u8..=223, any::<u8>(), any::<u8>(), 1u8..=254, 1024u16..65535u16)
        .prop_filter("must be public IP", |&(a, b, ..)| {
            let ip = std::net::Ipv4Addr::new(a, b, 0, 0);
            !ip.is_private() && !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
        })
        .prop_map(|(a, b, c, d, port)| {
            format!("/ip4/{a}.{b}.{c}.{d}/udp/{port}/quic-v1")
                .parse()
                .expect("generated public IP4/UDP/QUIC multiaddr is always valid")
        })
}

pub fn arb_private_multiaddr() -> impl Strategy<Value = Multiaddr> {
    prop_oneof![
        (any::<u8>(), any::<u8>(), any::<u8>(), 1024u16..65535u16)
            .prop_map(|(b, c, d, port)| format!("/ip4/10.{b}.{c}.{d}/tcp/{port}")),
        (16u8..=31, any::<u8>(), any::<u8>(), 1024u16..65535u16)
            .prop_map(|(b, c, d, port)| format!("/ip4/172.{b}.{c}.{d}/udp/{port}/quic-v1")),
        (any::<u8>(), any::<u8>(), 1024u16..65535u16)
            .prop_map(|(c, d, port)| format!("/ip4/192.168.{c}.{d}/tcp/{port}")),
        (any::<u8>(), any::<u8>(), 1024u16..65535u16)
            .prop_map(|(c, d, port)| format!("/ip4/127.0.{c}.{d}/tcp/{port}")),
    ]
    .prop_map(|s| {
        s.parse()
            .expect("generated private multiaddr is always valid")
    })
}

pub fn arb_relay_circuit_multiaddr() -> impl Strategy<Value = Multiaddr> {
    (
        prop_oneof![arb_public_multiaddr(), arb_private_multiaddr()],
        arb_peer_id(),
    )
        .prop_map(|(mut addr, relay_peer)| {
            addr.push(Protocol::P2p(relay_peer));
            addr.push(Protocol::P2pCircuit);
            addr
        })
}

// ─── Resource generators ────────────────────────────────────────────────────

pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_600_000_000i64..2_000_000_000i64, 0u32..1_000_000_000u32).prop_map(|(secs, nanos)| {
        DateTime::from_timestamp(secs, nanos).expect("generated timestamp is in range")
    })
}

pub fn arb_resource() -> impl Strategy<Value = Resource> {
    (
        arb_peer_id(),
        "[A-Za-z0-9 ]{1,24}",
        0u32..=512,
        0.0f64..100_000.0,
        proptest::collection::vec("[a-z0-9.:-]{1,16}", 0..6),
        any::<bool>(),
        arb_timestamp(),
    )
        .prop_map(
            |(peer, gpu_model, vram_gb, tokens_throughput, supported_models, worker_mode, at)| {
                Resource::new(
                    &peer,
                    gpu_model,
                    vram_gb,
                    tokens_throughput,
                    supported_models,
                    worker_mode,
                )
                .restamped(at)
            },
        )
}

pub fn sample_resource() -> Resource {
    Resource::new(
        &PeerId::random(),
        "RTX 4090",
        24,
        42.5,
        vec!["llama3.2".to_string(), "mistral".to_string()],
        true,
    )
}

// ─── Collaborator doubles ───────────────────────────────────────────────────

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory provider directory with a fixed provider list.
#[derive(Default)]
pub struct FakeDirectory {
    providers: Mutex<Vec<PeerId>>,
    provided: Mutex<Vec<NamespaceKey>>,
    fail_lookups: AtomicBool,
    fail_provides: AtomicBool,
}

impl FakeDirectory {
    pub fn with_providers(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            providers: Mutex::new(peers.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn provided(&self) -> Vec<NamespaceKey> {
        locked(&self.provided).clone()
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }

    pub fn fail_provides(&self) {
        self.fail_provides.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderDirectory for FakeDirectory {
    async fn provide(&self, key: &NamespaceKey) -> Result<(), DhtError> {
        match self.fail_provides.load(Ordering::SeqCst) {
            true => Err(DhtError::Store("store full".to_string())),
            false => {
                locked(&self.provided).push(key.clone());
                Ok(())
            }
        }
    }

    async fn find_providers(
        &self,
        _key: &NamespaceKey,
        limit: usize,
    ) -> Result<mpsc::Receiver<PeerId>, DhtError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DhtError::NoKnownPeers);
        }
        let (tx, rx) = mpsc::channel(limit.max(1));
        for peer in locked(&self.providers).iter().take(limit) {
            let _ = tx.try_send(*peer);
        }
        Ok(rx)
    }
}

#[derive(Clone)]
enum Reply {
    Respond(Resource),
    Fail,
    Hang,
    Gated(Arc<Notify>, Resource),
}

/// Scripted metadata fetcher; unscripted peers fail as if they sent nothing.
#[derive(Default)]
pub struct FakeFetcher {
    replies: Mutex<HashMap<PeerId, Reply>>,
    calls: Mutex<HashMap<PeerId, usize>>,
}

impl FakeFetcher {
    pub fn respond(&self, peer: PeerId, resource: Resource) {
        locked(&self.replies).insert(peer, Reply::Respond(resource));
    }

    pub fn fail(&self, peer: PeerId) {
        locked(&self.replies).insert(peer, Reply::Fail);
    }

    /// The peer never answers; every fetch runs into its deadline.
    pub fn hang(&self, peer: PeerId) {
        locked(&self.replies).insert(peer, Reply::Hang);
    }

    /// The next fetch blocks until the returned handle is notified.
    pub fn gate(&self, peer: PeerId, resource: Resource) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        locked(&self.replies).insert(peer, Reply::Gated(release.clone(), resource));
        release
    }

    pub fn calls(&self, peer: &PeerId) -> usize {
        locked(&self.calls).get(peer).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataFetcher for FakeFetcher {
    async fn fetch(&self, peer: PeerId, deadline: Duration) -> Result<Resource, MetadataError> {
        *locked(&self.calls).entry(peer).or_default() += 1;
        let reply = locked(&self.replies).get(&peer).cloned();
        match reply {
            Some(Reply::Respond(resource)) => Ok(resource.with_peer_id(&peer)),
            Some(Reply::Gated(release, resource)) => {
                release.notified().await;
                Ok(resource.with_peer_id(&peer))
            }
            Some(Reply::Hang) => {
                tokio::time::sleep(deadline).await;
                Err(MetadataError::Timeout(deadline))
            }
            Some(Reply::Fail) | None => Err(MetadataError::Empty),
        }
    }
}

/// Health view that records what the discoverer reports.
#[derive(Default)]
pub struct RecordingHealthView {
    unhealthy: Mutex<HashSet<PeerId>>,
    removed: Mutex<Vec<PeerId>>,
}

impl RecordingHealthView {
    pub fn mark_unhealthy(&self, peer: PeerId) {
        locked(&self.unhealthy).insert(peer);
    }

    pub fn removed(&self) -> Vec<PeerId> {
        locked(&self.removed).clone()
    }
}

impl PeerHealthView for RecordingHealthView {
    fn is_peer_unhealthy(&self, peer: &PeerId) -> bool {
        locked(&self.unhealthy).contains(peer)
    }

    fn mark_peer_as_recently_removed(&self, peer: &PeerId) {
        locked(&self.unhealthy).insert(*peer);
        locked(&self.removed).push(*peer);
    }
}
