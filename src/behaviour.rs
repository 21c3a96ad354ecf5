use libp2p::{
    PeerId, dcutr, identify, identity::Keypair, kad, ping, relay, swarm::NetworkBehaviour,
};

use crate::protocol;

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl Behaviour {
    /// Kademlia runs in server mode so this node answers provider lookups too.
    pub fn new(keypair: &Keypair, relay_client: relay::client::Behaviour) -> Self {
        let peer_id = PeerId::from(keypair.public());

        let mut kad_config = kad::Config::new(protocol::kad_protocol());
        kad_config.set_query_timeout(protocol::KAD_QUERY_TIMEOUT);
        let store = kad::store::MemoryStore::new(peer_id);
        let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            protocol::IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        Self {
            kademlia,
            relay_client,
            dcutr: dcutr::Behaviour::new(peer_id),
            identify,
            ping: ping::Behaviour::default(),
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}
