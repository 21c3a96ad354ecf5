use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use libp2p::{PeerId, kad, multihash::Multihash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::PEER_NAMESPACE;

// ─── Resource ───────────────────────────────────────────────────────────────

/// Capability descriptor a node reports about itself over the metadata protocol.
///
/// Values are never mutated after construction; updates produce a new value
/// and are shared behind `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Filled in by the requester from the authenticated stream, not trusted from the payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_id: String,
    pub gpu_model: String,
    pub vram_gb: u32,
    pub tokens_throughput: f64,
    pub supported_models: Vec<String>,
    pub worker_mode: bool,
    pub last_updated: DateTime<Utc>,
}

impl Resource {
    pub fn new(
        peer: &PeerId,
        gpu_model: impl Into<String>,
        vram_gb: u32,
        tokens_throughput: f64,
        supported_models: Vec<String>,
        worker_mode: bool,
    ) -> Self {
        Self {
            peer_id: peer.to_base58(),
            gpu_model: gpu_model.into(),
            vram_gb,
            tokens_throughput,
            supported_models,
            worker_mode,
            last_updated: Utc::now(),
        }
    }

    pub fn with_peer_id(self, peer: &PeerId) -> Self {
        Self {
            peer_id: peer.to_base58(),
            ..self
        }
    }

    pub fn restamped(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_updated: at,
            ..self.clone()
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.last_updated)
    }

    /// Future-dated descriptors count as fresh; clock skew is not our concern here.
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match TimeDelta::from_std(max_age) {
            Ok(max_age) => self.age(now) <= max_age,
            Err(_) => true,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─── NamespaceKey ───────────────────────────────────────────────────────────

/// Multicodec code of the identity hash function.
const IDENTITY_HASH: u64 = 0x00;
const CID_V1: u8 = 0x01;
const RAW_CODEC: u8 = 0x55;

#[derive(Debug, Error)]
#[error("namespace '{namespace}' cannot be identity-hashed: {reason}")]
pub struct NamespaceError {
    namespace: String,
    reason: String,
}

/// DHT key every node provides and looks up to find the others.
///
/// The namespace bytes are wrapped in an identity multihash; the provider
/// record key is the multihash itself, matching how Kademlia providers are
/// keyed for a raw CIDv1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceKey {
    namespace: Arc<str>,
    multihash: Multihash<64>,
}

impl NamespaceKey {
    pub fn derive(namespace: &str) -> Result<Self, NamespaceError> {
        let multihash =
            Multihash::<64>::wrap(IDENTITY_HASH, namespace.as_bytes()).map_err(|e| {
                NamespaceError {
                    namespace: namespace.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(Self {
            namespace: namespace.into(),
            multihash,
        })
    }

    pub fn peers() -> Result<Self, NamespaceError> {
        Self::derive(PEER_NAMESPACE)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn multihash_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// Binary CIDv1 with the raw codec wrapping the identity multihash.
    pub fn cid_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![CID_V1, RAW_CODEC];
        bytes.extend(self.multihash.to_bytes());
        bytes
    }

    pub fn to_record_key(&self) -> kad::RecordKey {
        kad::RecordKey::new(&self.multihash.to_bytes())
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_peer_id, arb_resource};

    #[test]
    fn namespace_key_is_identity_multihash() {
        let key = NamespaceKey::peers().expect("peer namespace fits an identity multihash");
        let bytes = key.multihash_bytes();
        assert_eq!(bytes[0], 0x00, "identity hash code");
        assert_eq!(usize::from(bytes[1]), PEER_NAMESPACE.len(), "digest length");
        assert_eq!(&bytes[2..], PEER_NAMESPACE.as_bytes());
        assert_eq!(&key.cid_bytes()[..2], &[0x01, 0x55]);
    }

    #[test]
    fn namespace_key_is_deterministic() {
        let a = NamespaceKey::peers().expect("derive namespace key");
        let b = NamespaceKey::peers().expect("derive namespace key again");
        assert_eq!(a, b);
        assert_eq!(a.to_record_key(), b.to_record_key());
    }

    #[test]
    fn oversized_namespace_is_rejected() {
        let long = "n".repeat(65);
        assert!(NamespaceKey::derive(&long).is_err());
    }

    #[test]
    fn wire_field_names() {
        let peer = PeerId::random();
        let resource = Resource::new(&peer, "RTX 4090", 24, 51.5, vec!["llama3".into()], true);
        let value: serde_json::Value =
            serde_json::from_slice(&resource.to_json().expect("encode resource"))
                .expect("resource encodes to a JSON object");
        for field in [
            "gpu_model",
            "vram_gb",
            "tokens_throughput",
            "supported_models",
            "worker_mode",
            "last_updated",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn payload_without_peer_id_decodes() {
        let json = br#"{"gpu_model":"A100","vram_gb":80,"tokens_throughput":120.0,
            "supported_models":["mistral"],"worker_mode":true,
            "last_updated":"2025-01-01T00:00:00Z"}"#;
        let resource = Resource::from_json(json).expect("decode payload without peer id");
        assert!(resource.peer_id.is_empty());
        assert_eq!(resource.vram_gb, 80);
    }

    #[test]
    fn staleness_boundary() {
        let now = Utc::now();
        let resource = Resource::new(&PeerId::random(), "gpu", 8, 1.0, vec![], false)
            .restamped(now - TimeDelta::seconds(120));
        assert!(resource.is_fresh(Duration::from_secs(120), now));
        assert!(!resource.is_fresh(Duration::from_secs(119), now));
        assert!(resource.restamped(now + TimeDelta::seconds(30)).is_fresh(Duration::ZERO, now));
    }

    proptest! {
        #[test]
        fn resource_json_roundtrip(resource in arb_resource()) {
            let bytes = resource.to_json().expect("encode resource");
            let decoded = Resource::from_json(&bytes).expect("decode resource");
            prop_assert_eq!(decoded, resource);
        }

        #[test]
        fn with_peer_id_overrides_claimed_identity(
            resource in arb_resource(),
            peer in arb_peer_id(),
        ) {
            let stamped = resource.clone().with_peer_id(&peer);
            prop_assert_eq!(stamped.peer_id, peer.to_base58());
            prop_assert_eq!(stamped.last_updated, resource.last_updated);
        }
    }
}
