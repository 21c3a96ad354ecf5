//! Connection classification for NAT traversal statistics.
//!
//! Purely observational: nothing here feeds peer health or routing.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::{Multiaddr, core::ConnectedPoint, multiaddr::Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionKind {
    Relay,
    HolePunched,
    DirectExternal,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl From<&ConnectedPoint> for Direction {
    fn from(endpoint: &ConnectedPoint) -> Self {
        match endpoint {
            ConnectedPoint::Dialer { .. } => Direction::Outbound,
            ConnectedPoint::Listener { .. } => Direction::Inbound,
        }
    }
}

/// Classify a connection by its remote address and who dialed.
///
/// Any outbound non-relayed connection counts as hole-punched. There is no
/// signal that a punch actually happened, so this over-reports on public
/// networks.
pub fn classify(remote: &Multiaddr, direction: Direction) -> ConnectionKind {
    match (is_relay_circuit(remote), direction) {
        (true, _) => ConnectionKind::Relay,
        (false, Direction::Outbound) => ConnectionKind::HolePunched,
        (false, Direction::Inbound) => match is_local_addr(remote) {
            true => ConnectionKind::Local,
            false => ConnectionKind::DirectExternal,
        },
    }
}

pub fn classify_endpoint(endpoint: &ConnectedPoint) -> ConnectionKind {
    classify(endpoint.get_remote_address(), Direction::from(endpoint))
}

pub fn is_relay_circuit(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let link_local = first & 0xffc0 == 0xfe80;
    let unique_local = first & 0xfe00 == 0xfc00;
    ip.is_loopback() || ip.is_unspecified() || link_local || unique_local
}

/// Addresses without an IP component (DNS names) are treated as external.
pub fn is_local_addr(addr: &Multiaddr) -> bool {
    addr.iter()
        .find_map(|p| match p {
            Protocol::Ip4(ip) => Some(is_local_v4(ip)),
            Protocol::Ip6(ip) => Some(is_local_v6(ip)),
            _ => None,
        })
        .unwrap_or(false)
}

// ─── Aggregate statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NatStats {
    pub total: usize,
    pub relay: usize,
    pub hole_punched: usize,
    pub direct_external: usize,
    pub local: usize,
}

impl NatStats {
    pub fn record(&mut self, kind: ConnectionKind) {
        self.total = self.total.saturating_add(1);
        let slot = match kind {
            ConnectionKind::Relay => &mut self.relay,
            ConnectionKind::HolePunched => &mut self.hole_punched,
            ConnectionKind::DirectExternal => &mut self.direct_external,
            ConnectionKind::Local => &mut self.local,
        };
        *slot = slot.saturating_add(1);
    }

    /// Connections that reach beyond the local network, punched or direct.
    pub fn external(&self) -> usize {
        self.hole_punched.saturating_add(self.direct_external)
    }

    pub fn log(&self) {
        tracing::info!(
            total_connections = self.total,
            direct_connections = self.direct_external,
            relay_connections = self.relay,
            hole_punched_connections = self.hole_punched,
            local_connections = self.local,
            external_connections = self.external(),
            "NAT traversal statistics"
        );
    }
}

impl FromIterator<ConnectionKind> for NatStats {
    fn from_iter<I: IntoIterator<Item = ConnectionKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), |mut stats, kind| {
            stats.record(kind);
            stats
        })
    }
}
