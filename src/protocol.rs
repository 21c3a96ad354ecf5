use std::time::Duration;

use libp2p::StreamProtocol;

pub const KAD_PROTOCOL: &str = "/crowdnode/kad/1.0.0";
pub const METADATA_PROTOCOL: &str = "/crowdnode/metadata/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/crowdnode/id/1.0.0";

/// Every node advertises itself under the identity hash of this string.
pub const PEER_NAMESPACE: &str = "crowdnode-peers-v1";

/// Upper bound on a descriptor payload; the deadline alone does not bound memory.
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

pub const METADATA_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);
pub const KAD_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const LISTEN_ADDR_WAIT: Duration = Duration::from_secs(5);

pub fn kad_protocol() -> StreamProtocol {
    // Infallible: KAD_PROTOCOL is a compile-time constant starting with '/' as required by StreamProtocol
    StreamProtocol::try_from_owned(KAD_PROTOCOL.to_string())
        .expect("KAD_PROTOCOL is a valid compile-time constant protocol string")
}

pub fn metadata_protocol() -> StreamProtocol {
    // Infallible: METADATA_PROTOCOL is a compile-time constant starting with '/' as required by StreamProtocol
    StreamProtocol::try_from_owned(METADATA_PROTOCOL.to_string())
        .expect("METADATA_PROTOCOL is a valid compile-time constant protocol string")
}
