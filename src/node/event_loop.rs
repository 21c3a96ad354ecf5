use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Swarm, dcutr, identify, kad,
    swarm::{ConnectionId, SwarmEvent},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    behaviour::{Behaviour, BehaviourEvent},
    dht::{DhtError, SwarmCommand},
    health::PeerHealthManager,
    nat::{self, ConnectionKind},
    protocol,
};

enum PendingQuery {
    Provide(oneshot::Sender<Result<(), DhtError>>),
    Providers {
        sink: mpsc::Sender<PeerId>,
        seen: HashSet<PeerId>,
        limit: usize,
    },
}

/// Sole owner of the swarm. Everything else reaches it through `SwarmCommand`.
pub(crate) struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<SwarmCommand>,
    health: Arc<PeerHealthManager>,
    listen_addrs: watch::Sender<Vec<Multiaddr>>,
    pending: HashMap<kad::QueryId, PendingQuery>,
    connections: HashMap<ConnectionId, ConnectionKind>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<Behaviour>,
        commands: mpsc::Receiver<SwarmCommand>,
        health: Arc<PeerHealthManager>,
        listen_addrs: watch::Sender<Vec<Multiaddr>>,
    ) -> Self {
        Self {
            swarm,
            commands,
            health,
            listen_addrs,
            pending: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        tracing::debug!(pending_queries = self.pending.len(), "swarm loop stopped");
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Dial { addr } => {
                tracing::info!(%addr, "dialing bootstrap peer");
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    tracing::warn!(%addr, error = %e, "dial failed");
                }
            }
            SwarmCommand::AddAddress { peer, addr } => {
                self.swarm.behaviour_mut().kademlia.add_address(&peer, addr);
            }
            SwarmCommand::Bootstrap { reply } => {
                // An empty table is normal for the first node of a mesh. Identify
                // fills it as peers connect, and kademlia re-bootstraps on its own.
                if let Err(kad::NoKnownPeers()) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                    tracing::info!("routing table empty, waiting for peers to connect");
                }
                let _ = reply.send(Ok(()));
            }
            SwarmCommand::StartProviding { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(id) => {
                        self.pending.insert(id, PendingQuery::Provide(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(DhtError::Store(e.to_string())));
                    }
                }
            }
            SwarmCommand::GetProviders {
                key,
                limit,
                providers,
            } => {
                // Dropping the sender on a zero limit closes the caller's channel immediately.
                if limit > 0 {
                    let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                    self.pending.insert(
                        id,
                        PendingQuery::Providers {
                            sink: providers,
                            seen: HashSet::new(),
                            limit,
                        },
                    );
                }
            }
            SwarmCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            SwarmCommand::ConnectionStats { reply } => {
                let _ = reply.send(self.connections.values().copied().collect());
            }
        }
    }

    // ─── Swarm events ───────────────────────────────────────────────────────

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
                self.listen_addrs.send_modify(|addrs| {
                    if !addrs.contains(&address) {
                        addrs.push(address);
                    }
                });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                tracing::debug!(%address, "listen address expired");
                self.listen_addrs
                    .send_modify(|addrs| addrs.retain(|a| a != &address));
            }
            SwarmEvent::ListenerError { error, .. } => {
                tracing::warn!(error = %error, "listener error");
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                if let Err(e) = reason {
                    tracing::warn!(addresses = ?addresses, error = %e, "listener closed");
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let kind = nat::classify_endpoint(&endpoint);
                self.connections.insert(connection_id, kind);
                tracing::debug!(
                    peer = %peer_id,
                    %kind,
                    remote_addr = %endpoint.get_remote_address(),
                    num_established = num_established.get(),
                    "connection opened"
                );
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                cause,
                ..
            } => {
                self.connections.remove(&connection_id);
                tracing::debug!(
                    peer = %peer_id,
                    num_established,
                    cause = ?cause,
                    "connection closed"
                );
                // Tombstones unregistered peers too, bootstrap and routing contacts included.
                if num_established == 0 {
                    self.health.remove_peer(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!(peer = ?peer_id, error = %error, "outgoing connection failed");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                let speaks_kad = info
                    .protocols
                    .iter()
                    .any(|p| p.as_ref() == protocol::KAD_PROTOCOL);
                if speaks_kad {
                    for addr in info.listen_addrs {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr);
                    }
                }
            }
            BehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => self.handle_query_progress(id, result, step.last),
            BehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, .. }) => {
                tracing::debug!(%peer, "routing table updated");
            }
            BehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => tracing::info!(peer = %remote_peer_id, "hole punch succeeded"),
                Err(e) => tracing::debug!(peer = %remote_peer_id, error = %e, "hole punch failed"),
            },
            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::Bootstrap(result) => match (result, last) {
                (Ok(_), true) => tracing::info!("DHT bootstrap complete"),
                (Err(e), _) => tracing::debug!(error = %e, "DHT bootstrap step failed"),
                (Ok(_), false) => {}
            },
            kad::QueryResult::StartProviding(result) => {
                if let Some(PendingQuery::Provide(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| DhtError::Query(e.to_string())));
                }
            }
            kad::QueryResult::GetProviders(result) => self.handle_providers(id, result, last),
            _ => {}
        }
    }

    /// Stream providers to the caller, excluding ourselves, until the limit is
    /// reached, the caller hangs up, or the query ends.
    fn handle_providers(
        &mut self,
        id: kad::QueryId,
        result: Result<kad::GetProvidersOk, kad::GetProvidersError>,
        last: bool,
    ) {
        let local = *self.swarm.local_peer_id();
        let Some(PendingQuery::Providers { sink, seen, limit }) = self.pending.get_mut(&id) else {
            return;
        };

        let done = match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                let mut done = last;
                for peer in providers {
                    if peer == local || !seen.insert(peer) {
                        continue;
                    }
                    if sink.try_send(peer).is_err() || seen.len() >= *limit {
                        done = true;
                        break;
                    }
                }
                done
            }
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => true,
            Err(e) => {
                tracing::debug!(error = %e, "provider lookup failed");
                true
            }
        };

        if done {
            self.pending.remove(&id);
            if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                query.finish();
            }
        }
    }
}
