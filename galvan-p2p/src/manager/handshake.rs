//! Version handshake and feature negotiation handlers.

use std::net::Ipv4Addr;
use std::time::Duration;

use galvan_chain::BlockLocator;

use crate::config::{
    MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION, SENDADDRV2_VERSION, WTXID_RELAY_VERSION,
};
use crate::manager::PeerManager;
use crate::peer::{ConnectionDirection, HandshakeState, Peer, ServiceFlags};
use crate::protocol::{Message, NetAddress, VersionMessage};

/// Most peers allowed in the high-bandwidth compact block set.
const MAX_HB_COMPACT_PEERS: usize = 3;

impl PeerManager {
    /// Our `version` message for a given peer.
    pub(crate) fn build_version_message(&self, peer: &Peer, wall: i64) -> Message {
        let start_height = self
            .chain
            .active_tip()
            .map(|tip| self.chain.block_info(tip).height as i32)
            .unwrap_or(0);
        Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.config.local_services,
            timestamp: wall,
            addr_recv_services: peer.services().bits(),
            addr_recv: peer.address.clone(),
            addr_from_services: self.config.local_services,
            addr_from: NetAddress::ipv4(Ipv4Addr::UNSPECIFIED, 0),
            nonce: self.local_nonce,
            user_agent: self.config.user_agent.clone(),
            start_height,
            relay: self.config.tx_relay
                && !matches!(peer.direction, ConnectionDirection::BlockRelayOnly),
        })
    }

    pub(crate) fn handle_version(
        &self,
        peer: &Peer,
        version: VersionMessage,
        _now: Duration,
        wall: i64,
    ) {
        {
            let handshake = peer.handshake.lock().expect("handshake lock");
            if handshake.state != HandshakeState::AwaitingVersion {
                drop(handshake);
                self.misbehaving(peer, 20, "duplicate version message");
                return;
            }
        }

        // Self-connection: our own nonce coming back at us.
        if peer.direction == ConnectionDirection::Inbound && version.nonce == self.local_nonce {
            tracing::debug!(peer = %peer.id, "connected to self, disconnecting");
            self.connman.disconnect(peer.id);
            return;
        }

        if version.version < MIN_PEER_PROTO_VERSION {
            tracing::debug!(
                peer = %peer.id,
                version = version.version,
                "peer uses obsolete protocol version"
            );
            self.connman.disconnect(peer.id);
            return;
        }

        let services = ServiceFlags::from_bits(version.services);
        {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            handshake.state = HandshakeState::VersionReceived;
            handshake.version = version.version;
            handshake.services = services;
            handshake.remote_nonce = version.nonce;
            handshake.user_agent = version.user_agent.clone();
            handshake.start_height = version.start_height;
            handshake.relay_requested = version.relay;
        }
        tracing::debug!(
            peer = %peer.id,
            version = version.version,
            agent = %version.user_agent,
            height = version.start_height,
            "received version"
        );

        // Substates come into existence with the negotiation.
        if peer.direction.can_relay_tx() && self.config.tx_relay {
            peer.init_tx_relay(version.relay);
        }
        if peer.direction.can_relay_addr() {
            peer.init_addr_relay();
        }

        // Inbound peers get our version only after we saw theirs.
        if peer.direction == ConnectionDirection::Inbound {
            self.push(peer.id, self.build_version_message(peer, wall));
        }

        if version.version >= WTXID_RELAY_VERSION {
            self.push(peer.id, Message::WtxidRelay);
        }
        if version.version >= SENDADDRV2_VERSION {
            self.push(peer.id, Message::SendAddrV2);
        }
        self.push(peer.id, Message::Verack);

        // Outbound connections that can serve blocks become preferred
        // download sources.
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            if let Some(state) = downloader.peer_mut(peer.id) {
                state.preferred_download = peer.direction.is_outbound()
                    && !peer.direction.is_short_lived()
                    && services.can_serve_blocks();
            }
        }

        // Solicit addresses from full outbound and addr-fetch peers.
        if matches!(
            peer.direction,
            ConnectionDirection::OutboundFullRelay
                | ConnectionDirection::Manual
                | ConnectionDirection::AddrFetch
        ) {
            let send_getaddr = {
                let mut guard = peer.addr_relay.lock().expect("addr relay lock");
                match guard.as_mut() {
                    Some(relay) if !relay.getaddr_sent => {
                        relay.getaddr_sent = true;
                        // Responses to our own request do not count
                        // against the peer's rate limit.
                        relay.token_bucket += crate::config::MAX_ADDR_PROCESSING_TOKEN_BUCKET;
                        true
                    }
                    _ => false,
                }
            };
            if send_getaddr {
                self.push(peer.id, Message::GetAddr);
            }
        }
    }

    pub(crate) fn handle_verack(&self, peer: &Peer, now: Duration) {
        let version = {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            if handshake.state != HandshakeState::VersionReceived {
                tracing::debug!(peer = %peer.id, "verack out of order, ignoring");
                return;
            }
            handshake.state = HandshakeState::FullyConnected;
            handshake.version
        };
        tracing::debug!(peer = %peer.id, version, "handshake complete");

        // Announce blocks with headers when the peer speaks them.
        self.push(peer.id, Message::SendHeaders);
        // Negotiate compact blocks (v2 only, low bandwidth default).
        self.push(
            peer.id,
            Message::SendCmpct {
                announce: false,
                version: crate::config::CMPCTBLOCKS_VERSION,
            },
        );

        // Full outbound peers drive our initial headers sync.
        if peer.direction.is_outbound() && !peer.direction.is_short_lived() {
            self.maybe_start_headers_sync(peer, now);
        }
    }

    /// Start a headers sync with this peer unless another one is
    /// already serving it (a single sync peer during IBD; anyone once
    /// we are near the tip).
    pub(crate) fn maybe_start_headers_sync(&self, peer: &Peer, now: Duration) {
        if !peer.services().can_serve_recent_blocks() {
            return;
        }
        {
            let mut sync_peer = self.headers_sync_peer.lock().expect("sync peer lock");
            if self.chain.is_initial_block_download() {
                match *sync_peer {
                    Some(existing) if existing != peer.id => return,
                    _ => *sync_peer = Some(peer.id),
                }
            }
        }
        let locator = self.chain.get_locator(self.chain.best_header());
        if self.send_getheaders(peer, locator, galvan_core::ZERO_HASH, now) {
            tracing::debug!(peer = %peer.id, "starting headers sync");
            let mut state = peer.headers_state.lock().expect("headers state lock");
            let best_height = self
                .chain
                .best_header()
                .map(|h| self.chain.block_info(h).height)
                .unwrap_or(0);
            let expected = peer
                .handshake
                .lock()
                .expect("handshake lock")
                .start_height
                .max(0) as u64;
            let expected_missing = expected.saturating_sub(best_height as u64);
            state.sync_timeout =
                Some(now + crate::sync::HeadersSyncState::timeout_for(expected_missing));
        }
    }

    pub(crate) fn handle_wtxidrelay(&self, peer: &Peer) {
        let mut handshake = peer.handshake.lock().expect("handshake lock");
        match handshake.state {
            HandshakeState::VersionReceived => {
                if handshake.version >= WTXID_RELAY_VERSION {
                    handshake.wtxid_relay = true;
                }
            }
            _ => {
                // Negotiation after verack is a protocol violation.
                drop(handshake);
                tracing::debug!(peer = %peer.id, "wtxidrelay outside negotiation");
                self.connman.disconnect(peer.id);
            }
        }
    }

    pub(crate) fn handle_sendaddrv2(&self, peer: &Peer) {
        let mut handshake = peer.handshake.lock().expect("handshake lock");
        match handshake.state {
            HandshakeState::VersionReceived => handshake.wants_addrv2 = true,
            _ => {
                drop(handshake);
                tracing::debug!(peer = %peer.id, "sendaddrv2 outside negotiation");
                self.connman.disconnect(peer.id);
            }
        }
    }

    pub(crate) fn handle_sendheaders(&self, peer: &Peer) {
        peer.handshake
            .lock()
            .expect("handshake lock")
            .prefers_headers = true;
    }

    pub(crate) fn handle_sendcmpct(&self, peer: &Peer, announce: bool, version: u64) {
        if version != crate::config::CMPCTBLOCKS_VERSION {
            // Future or legacy compact block versions are ignored.
            return;
        }
        {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            handshake.provides_cmpctblocks = true;
            handshake.wants_cmpct_hb = announce;
        }
        self.update_hb_compact_peers(peer, announce);
    }

    /// Maintain the set of peers we announce via compact block first.
    ///
    /// At most three peers; when adding an inbound would evict the
    /// only outbound member, the oldest inbound goes instead.
    fn update_hb_compact_peers(&self, peer: &Peer, wants_hb: bool) {
        let mut hb = self.hb_compact_peers.lock().expect("hb peers lock");
        hb.retain(|id| *id != peer.id);
        if !wants_hb {
            return;
        }
        hb.push_back(peer.id);
        while hb.len() > MAX_HB_COMPACT_PEERS {
            let victim = self.pick_hb_eviction_victim(&hb, peer);
            if let Some(pos) = hb.iter().position(|id| *id == victim) {
                hb.remove(pos);
            } else {
                hb.pop_front();
            }
        }
    }

    fn pick_hb_eviction_victim(
        &self,
        hb: &std::collections::VecDeque<crate::peer::PeerId>,
        newcomer: &Peer,
    ) -> crate::peer::PeerId {
        let oldest = *hb.front().expect("non-empty");
        if newcomer.direction != ConnectionDirection::Inbound {
            return oldest;
        }
        let directions: Vec<(crate::peer::PeerId, bool)> = hb
            .iter()
            .filter_map(|id| self.peer(*id).map(|p| (*id, p.direction.is_outbound())))
            .collect();
        let outbound_count = directions.iter().filter(|(_, o)| *o).count();
        let oldest_is_outbound = directions.first().map(|(_, o)| *o).unwrap_or(false);
        if oldest_is_outbound && outbound_count == 1 {
            // Keep the last outbound slot; evict the oldest inbound.
            directions
                .iter()
                .find(|(_, outbound)| !*outbound)
                .map(|(id, _)| *id)
                .unwrap_or(oldest)
        } else {
            oldest
        }
    }

    /// Build the locator used for continuation `getheaders` after a
    /// connecting headers batch.
    pub(crate) fn tip_locator(&self) -> BlockLocator {
        self.chain.get_locator(self.chain.best_header())
    }
}
