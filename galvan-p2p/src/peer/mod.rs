//! Per-peer connection state.
//!
//! A [`Peer`] is a bag of independently locked substates: handshake
//! data, misbehavior score, optional transaction-relay and
//! address-relay substates, block announcement queues, the getdata
//! backlog and timers. Locks are leaf-level: nothing is called while
//! one is held, and the peer map lock is never taken inside them.

pub mod info;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use galvan_chain::BlockIndexHandle;
use galvan_core::Hash256;

use crate::config::{MAX_ADDR_TO_SEND, MAX_EXTRA_TXN};
use crate::filters::{BloomFilter, SeenCache};
use crate::protocol::{InvItem, NetAddress, TimedAddress};
use crate::sync::headers::HeadersSyncState;

pub use info::{ConnectionDirection, HandshakeState, PeerId, ServiceFlags};

/// Capacity of the per-peer known-transactions rolling set.
const KNOWN_TX_CAPACITY: usize = 25_000;

/// Capacity of the per-peer known-addresses rolling set.
const KNOWN_ADDR_CAPACITY: usize = 5_000;

/// Negotiated handshake data.
#[derive(Debug, Default)]
pub struct Handshake {
    pub state: HandshakeState,
    pub version: i32,
    pub services: ServiceFlags,
    pub remote_nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// BIP 37 relay flag from the peer's version message.
    pub relay_requested: bool,
    /// BIP 339 wtxid relay, negotiated pre-verack.
    pub wtxid_relay: bool,
    /// BIP 155 addrv2 support, negotiated pre-verack.
    pub wants_addrv2: bool,
    /// Peer prefers `headers` over `inv` block announcements.
    pub prefers_headers: bool,
    /// Peer can produce compact blocks (sent `sendcmpct`).
    pub provides_cmpctblocks: bool,
    /// Peer asked for high-bandwidth compact block announcements.
    pub wants_cmpct_hb: bool,
}

/// Misbehavior accounting.
#[derive(Debug, Default)]
pub struct Misbehavior {
    /// Accumulated penalty points; monotonic.
    pub score: i32,
    /// Set when the score crosses the discouragement threshold.
    pub should_discourage: bool,
}

/// Transaction-relay substate; absent for block-relay-only peers.
#[derive(Debug)]
pub struct TxRelay {
    /// Whether the peer asked us to relay transactions at all.
    pub relay_txs: bool,
    /// Rolling set of tx hashes the peer is known to have.
    pub known: SeenCache<Hash256>,
    /// Queued announcement hashes (wtxid or txid per negotiation).
    pub to_announce: Vec<Hash256>,
    /// BIP 37 filter, if the peer loaded one.
    pub bloom: Option<BloomFilter>,
    /// Peer's advertised minimum fee rate (base units / kvB).
    pub fee_filter: i64,
    /// Next scheduled inventory trickle.
    pub next_inv_send: Option<Duration>,
    /// Announcement token bucket (burst control).
    pub token_bucket: f64,
    /// Last bucket refill time.
    pub last_refill: Option<Duration>,
    /// Whole-mempool announcement requested via `mempool`.
    pub send_mempool: bool,
    /// Next scheduled fee filter broadcast.
    pub next_feefilter_send: Option<Duration>,
    /// Fee rate we last told this peer about.
    pub last_feefilter_sent: i64,
}

impl TxRelay {
    fn new(relay_txs: bool) -> Self {
        Self {
            relay_txs,
            known: SeenCache::new(KNOWN_TX_CAPACITY),
            to_announce: Vec::new(),
            bloom: None,
            fee_filter: 0,
            next_inv_send: None,
            token_bucket: crate::config::INVENTORY_BROADCAST_MAX as f64,
            last_refill: None,
            send_mempool: false,
            next_feefilter_send: None,
            last_feefilter_sent: -1,
        }
    }
}

/// Address-relay substate; created lazily on the first address
/// interaction, and never for block-relay-only connections.
#[derive(Debug)]
pub struct AddrRelay {
    /// Rolling set of address identities the peer is known to have.
    pub known: SeenCache<Vec<u8>>,
    /// Queued addresses to send.
    pub to_send: Vec<TimedAddress>,
    /// Next scheduled address trickle.
    pub next_send: Option<Duration>,
    /// Next scheduled self-advertisement.
    pub next_local_send: Option<Duration>,
    /// Processing rate-limit token bucket.
    pub token_bucket: f64,
    /// Last bucket refill time.
    pub last_refill: Option<Duration>,
    /// Whether we already credited the bucket for our `getaddr`.
    pub getaddr_sent: bool,
    /// Whether we already answered this peer's `getaddr`.
    pub getaddr_answered: bool,
    /// Total addresses accepted for processing.
    pub addrs_processed: u64,
    /// Total addresses dropped by the rate limiter.
    pub addrs_rate_limited: u64,
}

impl AddrRelay {
    fn new() -> Self {
        Self {
            known: SeenCache::new(KNOWN_ADDR_CAPACITY),
            to_send: Vec::new(),
            next_send: None,
            next_local_send: None,
            // One initial token; getaddr responses get a larger credit.
            token_bucket: 1.0,
            last_refill: None,
            getaddr_sent: false,
            getaddr_answered: false,
            addrs_processed: 0,
            addrs_rate_limited: 0,
        }
    }

    /// Queue an address for sending, replacing a random entry when
    /// the queue is full so floods cannot grow memory.
    pub fn push_addr(&mut self, entry: TimedAddress, rng: &mut impl rand::Rng) {
        if self.known.contains(&entry.address.identity_key()) {
            return;
        }
        if self.to_send.len() >= MAX_ADDR_TO_SEND {
            let index = rng.gen_range(0..self.to_send.len());
            self.to_send[index] = entry;
        } else {
            self.to_send.push(entry);
        }
    }
}

/// Block announcement queues.
#[derive(Debug, Default)]
pub struct BlockAnnounce {
    /// Hashes to announce via `inv`.
    pub inv_to_send: Vec<Hash256>,
    /// Hashes to announce via `headers` (or compact block).
    pub headers_to_send: Vec<Hash256>,
    /// If set, the peer's last `getblocks` hit our 500-inv limit at
    /// this hash; announce it to trigger the next batch.
    pub continuation_block: Option<Hash256>,
}

/// Ping bookkeeping.
#[derive(Debug, Default)]
pub struct PingState {
    /// Nonce of the outstanding ping, if any.
    pub nonce: Option<u64>,
    /// When the outstanding ping was sent.
    pub sent_at: Option<Duration>,
    /// Next scheduled ping.
    pub next_ping: Option<Duration>,
    /// Best observed round-trip time.
    pub best_rtt: Option<Duration>,
}

/// Outbound-peer chain-sync eviction state.
#[derive(Debug, Default)]
pub struct ChainSyncTimeout {
    /// When the peer must prove a competitive chain.
    pub timeout: Option<Duration>,
    /// Our tip when the timeout was armed.
    pub work_header: Option<BlockIndexHandle>,
    /// Whether the warning `getheaders` went out.
    pub sent_getheaders: bool,
    /// Protected peers are exempt from this eviction.
    pub protected: bool,
}

/// Headers-relay and headers-sync state.
#[derive(Debug, Default)]
pub struct HeadersState {
    /// Last time we sent this peer a `getheaders`.
    pub last_getheaders: Option<Duration>,
    /// Consecutive unconnecting `headers` messages.
    pub unconnecting_count: u32,
    /// Active anti-DoS headers sync, if any.
    pub sync: Option<HeadersSyncState>,
    /// Deadline for initial headers sync from this peer.
    pub sync_timeout: Option<Duration>,
}

/// Extra transactions kept for compact block reconstruction.
#[derive(Debug, Default)]
pub struct ExtraTxnBuffer {
    buffer: VecDeque<(Hash256, galvan_core::Transaction)>,
}

impl ExtraTxnBuffer {
    /// Remember a transaction that failed mempool entry.
    pub fn push(&mut self, wtxid: Hash256, tx: galvan_core::Transaction) {
        if self.buffer.len() >= MAX_EXTRA_TXN {
            self.buffer.pop_front();
        }
        self.buffer.push_back((wtxid, tx));
    }

    /// Look a transaction up by wtxid.
    pub fn get(&self, wtxid: &Hash256) -> Option<&galvan_core::Transaction> {
        self.buffer
            .iter()
            .find(|(id, _)| id == wtxid)
            .map(|(_, tx)| tx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Hash256, galvan_core::Transaction)> {
        self.buffer.iter()
    }
}

/// A connected peer.
pub struct Peer {
    pub id: PeerId,
    pub address: NetAddress,
    pub direction: ConnectionDirection,
    /// When the connection was established.
    pub connected_at: Duration,
    pub handshake: Mutex<Handshake>,
    pub misbehavior: Mutex<Misbehavior>,
    pub tx_relay: Mutex<Option<TxRelay>>,
    pub addr_relay: Mutex<Option<AddrRelay>>,
    pub block_announce: Mutex<BlockAnnounce>,
    pub getdata_queue: Mutex<VecDeque<InvItem>>,
    pub ping: Mutex<PingState>,
    pub chain_sync: Mutex<ChainSyncTimeout>,
    pub headers_state: Mutex<HeadersState>,
    /// Time of the peer's last new-block announcement.
    pub last_block_announcement: Mutex<Option<Duration>>,
    /// Time the peer last gave us a transaction / a block.
    pub last_tx_time: Mutex<Option<Duration>>,
    pub last_block_time: Mutex<Option<Duration>>,
}

impl Peer {
    /// Create state for a fresh connection.
    pub fn new(
        id: PeerId,
        address: NetAddress,
        direction: ConnectionDirection,
        now: Duration,
    ) -> Self {
        Self {
            id,
            address,
            direction,
            connected_at: now,
            handshake: Mutex::new(Handshake::default()),
            misbehavior: Mutex::new(Misbehavior::default()),
            tx_relay: Mutex::new(None),
            addr_relay: Mutex::new(None),
            block_announce: Mutex::new(BlockAnnounce::default()),
            getdata_queue: Mutex::new(VecDeque::new()),
            ping: Mutex::new(PingState::default()),
            chain_sync: Mutex::new(ChainSyncTimeout::default()),
            headers_state: Mutex::new(HeadersState::default()),
            last_block_announcement: Mutex::new(None),
            last_tx_time: Mutex::new(None),
            last_block_time: Mutex::new(None),
        }
    }

    /// Whether the version/verack exchange has completed.
    pub fn is_fully_connected(&self) -> bool {
        self.handshake
            .lock()
            .expect("handshake lock")
            .state
            .is_fully_connected()
    }

    /// Negotiated protocol version (0 before the handshake).
    pub fn version(&self) -> i32 {
        self.handshake.lock().expect("handshake lock").version
    }

    /// The peer's advertised services.
    pub fn services(&self) -> ServiceFlags {
        self.handshake.lock().expect("handshake lock").services
    }

    /// Whether wtxid relay was negotiated.
    pub fn wtxid_relay(&self) -> bool {
        self.handshake.lock().expect("handshake lock").wtxid_relay
    }

    /// Initialize the transaction-relay substate once.
    pub fn init_tx_relay(&self, relay_txs: bool) {
        let mut guard = self.tx_relay.lock().expect("tx relay lock");
        if guard.is_none() {
            *guard = Some(TxRelay::new(relay_txs));
        }
    }

    /// Initialize the address-relay substate once.
    pub fn init_addr_relay(&self) {
        let mut guard = self.addr_relay.lock().expect("addr relay lock");
        if guard.is_none() {
            *guard = Some(AddrRelay::new());
        }
    }

    /// Whether this peer participates in transaction relay.
    pub fn relays_txs(&self) -> bool {
        self.tx_relay
            .lock()
            .expect("tx relay lock")
            .as_ref()
            .map(|relay| relay.relay_txs)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address.to_string())
            .field("direction", &self.direction)
            .finish()
    }
}
