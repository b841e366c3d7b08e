//! P2P configuration and protocol constants.
//!
//! The constants mirror the reference protocol limits; changing them
//! changes what counts as misbehavior, so they are not configurable.

use std::time::Duration;

/// Current protocol version.
pub const PROTOCOL_VERSION: i32 = 70016;

/// Disconnect peers older than this version.
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;

/// Minimum version for wtxid-based transaction relay (BIP 339).
pub const WTXID_RELAY_VERSION: i32 = 70016;

/// Minimum version for addrv2 address relay (BIP 155).
pub const SENDADDRV2_VERSION: i32 = 70016;

/// Compact block protocol version we speak (BIP 152, segwit).
pub const CMPCTBLOCKS_VERSION: u64 = 2;

/// Hard cap on a frame's payload.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Maximum entries in an `inv` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum hashes in a block locator.
pub const MAX_LOCATOR_SZ: usize = 101;

/// Maximum headers per `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum entries in a `getdata` message.
pub const MAX_GETDATA_SZ: usize = 1_000;

/// Maximum addresses per `addr`/`addrv2` message.
pub const MAX_ADDR_TO_SEND: usize = 1_000;

/// Maximum parallel block downloads per peer.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;

/// Window, beyond our tip, within which blocks are fetched.
pub const BLOCK_DOWNLOAD_WINDOW: u32 = 1024;

/// Disconnect the peer blocking the download window after this long.
pub const BLOCK_STALLING_TIMEOUT: Duration = Duration::from_secs(2);

/// Base block download timeout, in units of the target spacing.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: f64 = 1.0;

/// Additional per-competing-peer block download timeout.
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: f64 = 0.5;

/// Maximum blocks announced via headers instead of inv.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Serve compact blocks only this deep below the tip.
pub const MAX_CMPCTBLOCK_DEPTH: u32 = 5;

/// Serve `blocktxn` only this deep below the tip.
pub const MAX_BLOCKTXN_DEPTH: u32 = 10;

/// Unconnecting headers before a misbehavior penalty.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// Old nodes without NODE_NETWORK serve only this many recent blocks.
pub const NODE_NETWORK_LIMITED_MIN_BLOCKS: u32 = 288;

/// Misbehavior score that marks a peer for discouragement.
pub const DISCOURAGEMENT_THRESHOLD: i32 = 100;

/// Maximum transaction announcements tracked per peer.
pub const MAX_PEER_TX_ANNOUNCEMENTS: usize = 5_000;

/// Maximum in-flight transaction requests per peer before delaying.
pub const MAX_PEER_TX_REQUEST_IN_FLIGHT: usize = 100;

/// Delay before requesting by txid when wtxid peers exist.
pub const TXID_RELAY_DELAY: Duration = Duration::from_secs(2);

/// Delay before requesting from a non-preferred peer.
pub const NONPREF_PEER_TX_DELAY: Duration = Duration::from_secs(2);

/// Delay before requesting from a peer with many requests in flight.
pub const OVERLOADED_PEER_TX_DELAY: Duration = Duration::from_secs(2);

/// How long a requested transaction may take before expiry.
pub const GETDATA_TX_INTERVAL: Duration = Duration::from_secs(60);

/// Average transaction announcement rate to a peer.
pub const INVENTORY_BROADCAST_PER_SECOND: usize = 7;

/// Largest burst of transaction announcements to a peer.
pub const INVENTORY_BROADCAST_MAX: usize =
    INVENTORY_BROADCAST_PER_SECOND * INBOUND_INVENTORY_BROADCAST_INTERVAL.as_secs() as usize;

/// Average trickle interval for inbound peers.
pub const INBOUND_INVENTORY_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Average trickle interval for outbound peers.
pub const OUTBOUND_INVENTORY_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Average interval between address broadcasts.
pub const AVG_ADDRESS_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// Average interval between self-advertisements.
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Epoch after which address-relay fan-out targets rotate.
pub const ROTATE_ADDR_RELAY_DEST_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Address processing rate limit (tokens per second).
pub const MAX_ADDR_RATE_PER_SECOND: f64 = 0.1;

/// Address token bucket capacity.
pub const MAX_ADDR_PROCESSING_TOKEN_BUCKET: f64 = 1000.0;

/// Percentage of addrman handed out per `getaddr`.
pub const MAX_PCT_ADDR_TO_SEND: usize = 23;

/// Time penalty applied to addresses learned from third parties.
pub const ADDR_TIME_PENALTY: i64 = 2 * 60 * 60;

/// Maximum filters per `getcfilters` batch.
pub const MAX_GETCFILTERS_SIZE: u32 = 1_000;

/// Maximum headers per `getcfheaders` batch.
pub const MAX_GETCFHEADERS_SIZE: u32 = 2_000;

/// Spacing of compact filter checkpoints.
pub const CFCHECKPT_INTERVAL: u32 = 1_000;

/// How long relayed transactions stay servable after mempool exit.
pub const RELAY_TX_CACHE_TIME: Duration = Duration::from_secs(15 * 60);

/// Mempool entries younger than this are only served to the requester.
pub const UNCONDITIONAL_RELAY_DELAY: Duration = Duration::from_secs(2 * 60);

/// Interval between pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Disconnect if a ping goes unanswered this long.
pub const TIMEOUT_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Outbound peer chain-sync lag allowance before eviction starts.
pub const CHAIN_SYNC_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Time allowed for a `getheaders` response during eviction checks.
pub const HEADERS_RESPONSE_TIME: Duration = Duration::from_secs(2 * 60);

/// Cadence of the extra-peer eviction pass.
pub const EXTRA_PEER_CHECK_INTERVAL: Duration = Duration::from_secs(45);

/// Cadence of the stale-tip check.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Outbound peers protected from chain-sync eviction.
pub const MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT: usize = 4;

/// Base headers-sync timeout.
pub const HEADERS_DOWNLOAD_TIMEOUT_BASE: Duration = Duration::from_secs(15 * 60);

/// Additional headers-sync timeout per expected header.
pub const HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER: Duration = Duration::from_millis(1);

/// Average interval between fee filter updates.
pub const AVG_FEEFILTER_BROADCAST_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Bound on a compact block's prefilled + short ID count.
pub const MAX_CMPCTBLOCK_TXN: usize = 100_000;

/// Extra transactions kept for compact block reconstruction.
pub const MAX_EXTRA_TXN: usize = 100;

/// Default user agent string.
pub const DEFAULT_USER_AGENT: &str = "/galvan:0.1.0/";

/// Configuration for the message-processing engine.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Network magic prefixing every frame.
    pub magic: [u8; 4],
    /// Service bits we advertise.
    pub local_services: u64,
    /// User agent sent in our version message.
    pub user_agent: String,
    /// Whether we relay transactions at all (false for blocks-only).
    pub tx_relay: bool,
    /// Whether we serve BIP 157/158 compact filters.
    pub serve_compact_filters: bool,
    /// Our externally reachable address, if known; gossiped to peers.
    pub local_address: Option<crate::protocol::NetAddress>,
    /// Maximum full-relay outbound connections.
    pub max_outbound_full_relay: usize,
    /// Maximum block-relay-only outbound connections.
    pub max_outbound_block_relay: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            local_services: crate::peer::ServiceFlags::NETWORK.bits()
                | crate::peer::ServiceFlags::WITNESS.bits(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            tx_relay: true,
            serve_compact_filters: false,
            local_address: None,
            max_outbound_full_relay: 8,
            max_outbound_block_relay: 2,
        }
    }
}

impl P2pConfig {
    /// Create a configuration for the given network magic.
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            ..Default::default()
        }
    }

    /// Set the advertised service bits.
    pub fn with_services(mut self, services: u64) -> Self {
        self.local_services = services;
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Enable or disable transaction relay.
    pub fn with_tx_relay(mut self, tx_relay: bool) -> Self {
        self.tx_relay = tx_relay;
        self
    }

    /// Set the address we advertise for ourselves.
    pub fn with_local_address(mut self, address: crate::protocol::NetAddress) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Enable compact filter serving (adds the service bit).
    pub fn with_compact_filters(mut self) -> Self {
        self.serve_compact_filters = true;
        self.local_services |= crate::peer::ServiceFlags::COMPACT_FILTERS.bits();
        self
    }
}
