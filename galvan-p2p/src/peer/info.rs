//! Peer identification, direction and service flags.

use std::fmt;

/// Unique identifier for a peer connection, assigned on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Why and how a connection was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// The peer connected to us.
    Inbound,
    /// Full outbound connection relaying blocks, txs and addresses.
    OutboundFullRelay,
    /// Outbound connection relaying blocks only.
    BlockRelayOnly,
    /// Short-lived connection testing an address table entry.
    Feeler,
    /// Short-lived connection soliciting addresses.
    AddrFetch,
    /// Operator-requested connection; never auto-evicted.
    Manual,
}

impl ConnectionDirection {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, ConnectionDirection::Inbound)
    }

    /// Whether transaction relay is ever negotiated on this kind of
    /// connection.
    pub fn can_relay_tx(&self) -> bool {
        matches!(
            self,
            ConnectionDirection::Inbound
                | ConnectionDirection::OutboundFullRelay
                | ConnectionDirection::Manual
        )
    }

    /// Whether address gossip runs on this kind of connection.
    pub fn can_relay_addr(&self) -> bool {
        !matches!(
            self,
            ConnectionDirection::BlockRelayOnly | ConnectionDirection::Feeler
        )
    }

    /// Short-lived connections never participate in sync or gossip.
    pub fn is_short_lived(&self) -> bool {
        matches!(
            self,
            ConnectionDirection::Feeler | ConnectionDirection::AddrFetch
        )
    }
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionDirection::Inbound => "inbound",
            ConnectionDirection::OutboundFullRelay => "outbound-full-relay",
            ConnectionDirection::BlockRelayOnly => "block-relay-only",
            ConnectionDirection::Feeler => "feeler",
            ConnectionDirection::AddrFetch => "addr-fetch",
            ConnectionDirection::Manual => "manual",
        };
        write!(f, "{name}")
    }
}

/// Service bits advertised in version messages and address gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Serves the full block chain.
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);
    /// Accepts BIP 37 bloom-filtered connections.
    pub const BLOOM: ServiceFlags = ServiceFlags(1 << 2);
    /// Serves witness data.
    pub const WITNESS: ServiceFlags = ServiceFlags(1 << 3);
    /// Serves BIP 157/158 compact filters.
    pub const COMPACT_FILTERS: ServiceFlags = ServiceFlags(1 << 6);
    /// Serves only the most recent blocks.
    pub const NETWORK_LIMITED: ServiceFlags = ServiceFlags(1 << 10);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the peer can serve us historical blocks.
    pub fn can_serve_blocks(&self) -> bool {
        self.contains(ServiceFlags::NETWORK)
    }

    /// Whether the peer can serve at least recent blocks.
    pub fn can_serve_recent_blocks(&self) -> bool {
        self.can_serve_blocks() || self.contains(ServiceFlags::NETWORK_LIMITED)
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NONE
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;
    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

/// Version-handshake progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing received yet; only `version` is acceptable.
    #[default]
    AwaitingVersion,
    /// `version` received; feature negotiation may happen.
    VersionReceived,
    /// `verack` received; the connection is fully up.
    FullyConnected,
}

impl HandshakeState {
    pub fn is_fully_connected(&self) -> bool {
        matches!(self, HandshakeState::FullyConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_capabilities() {
        assert!(!ConnectionDirection::Inbound.is_outbound());
        assert!(ConnectionDirection::OutboundFullRelay.is_outbound());
        assert!(ConnectionDirection::BlockRelayOnly.is_outbound());

        assert!(ConnectionDirection::Inbound.can_relay_tx());
        assert!(!ConnectionDirection::BlockRelayOnly.can_relay_tx());
        assert!(!ConnectionDirection::BlockRelayOnly.can_relay_addr());
        assert!(ConnectionDirection::Feeler.is_short_lived());
    }

    #[test]
    fn test_service_flags() {
        let services = ServiceFlags::NETWORK | ServiceFlags::WITNESS;
        assert!(services.can_serve_blocks());
        assert!(services.contains(ServiceFlags::WITNESS));
        assert!(!services.contains(ServiceFlags::BLOOM));

        let limited = ServiceFlags::NETWORK_LIMITED;
        assert!(!limited.can_serve_blocks());
        assert!(limited.can_serve_recent_blocks());
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId::new(3).to_string(), "peer-3");
    }
}
