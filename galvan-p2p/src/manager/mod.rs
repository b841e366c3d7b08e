//! The message-processing engine.
//!
//! [`PeerManager`] owns all per-peer state and every anti-DoS policy.
//! It consumes two event streams — framed inbound messages and
//! per-peer send ticks — and drives the headers synchronizer, block
//! download scheduler, transaction request tracker and address
//! manager. Validation and sockets stay behind the collaborator
//! traits.
//!
//! Handlers are synchronous and hold no per-peer locks across
//! collaborator calls. Protocol violations are punished through the
//! misbehavior score and never propagate as errors.

mod addr;
mod handshake;
mod headers;
mod inventory;
mod tick;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;

use galvan_chain::{BlockIndexHandle, ChainManager, Mempool};
use galvan_core::crypto::siphash::SipHasher24;
use galvan_core::{Block, Hash256, Transaction};

use crate::config::{P2pConfig, DISCOURAGEMENT_THRESHOLD, RELAY_TX_CACHE_TIME};
use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionDirection, ExtraTxnBuffer, Peer, PeerId};
use crate::protocol::{CompactBlock, Message, NetAddress};
use crate::sync::BlockDownloader;
use crate::transport::{BanMan, BlockFilterIndex, ConnectionManager};
use crate::txrequest::TxRequestTracker;

/// Capacity of the recently-confirmed-transactions rolling filter.
const RECENT_CONFIRMED_CAPACITY: usize = 48_000;

/// Transactions recently relayed, still servable after mempool exit.
#[derive(Default)]
pub(crate) struct RelayCache {
    by_wtxid: HashMap<Hash256, Transaction>,
    expiry: VecDeque<(Duration, Hash256)>,
}

impl RelayCache {
    pub(crate) fn insert(&mut self, wtxid: Hash256, tx: Transaction, now: Duration) {
        self.by_wtxid.entry(wtxid).or_insert(tx);
        self.expiry.push_back((now + RELAY_TX_CACHE_TIME, wtxid));
    }

    pub(crate) fn get(&self, wtxid: &Hash256) -> Option<&Transaction> {
        self.by_wtxid.get(wtxid)
    }

    pub(crate) fn expire(&mut self, now: Duration) {
        while let Some((deadline, wtxid)) = self.expiry.front().copied() {
            if deadline > now {
                break;
            }
            self.expiry.pop_front();
            self.by_wtxid.remove(&wtxid);
        }
    }
}

/// The most recent block, pre-built as a compact block for
/// high-bandwidth announcement.
pub(crate) struct MostRecentBlock {
    pub hash: Hash256,
    pub compact: CompactBlock,
}

/// A compact block awaiting its `blocktxn` completion.
pub(crate) struct PendingCompact {
    pub peer: PeerId,
    pub compact: CompactBlock,
    /// Transactions recovered so far, indexed by position.
    pub recovered: Vec<Option<Transaction>>,
}

/// Network events consumed by the engine (connection side).
pub trait NetworkEventSink: Send + Sync {
    fn on_peer_connected(
        &self,
        peer: PeerId,
        address: NetAddress,
        direction: ConnectionDirection,
        now: Duration,
        wall: i64,
    );
    fn on_peer_disconnected(&self, peer: PeerId, now: Duration, wall: i64);
    fn on_message(&self, peer: PeerId, command: &str, payload: &[u8], now: Duration, wall: i64);
    fn tick_send(&self, peer: PeerId, now: Duration, wall: i64);
}

/// Validation events consumed by the engine (chain side).
pub trait ValidationEventSink: Send + Sync {
    fn on_block_connected(&self, block: &Block, handle: BlockIndexHandle, now: Duration);
    fn on_block_disconnected(&self, block: &Block);
    fn on_new_pow_valid_block(&self, handle: BlockIndexHandle, block: &Block);
}

/// The engine.
pub struct PeerManager {
    pub(crate) config: P2pConfig,
    pub(crate) chain: Arc<dyn ChainManager>,
    pub(crate) mempool: Arc<dyn Mempool>,
    pub(crate) connman: Arc<dyn ConnectionManager>,
    pub(crate) banman: Option<Arc<dyn BanMan>>,
    pub(crate) filter_index: Option<Arc<dyn BlockFilterIndex>>,

    pub(crate) peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    pub(crate) addrman: Mutex<crate::addrman::AddrMan>,
    pub(crate) downloader: Mutex<BlockDownloader>,
    pub(crate) txrequest: Mutex<TxRequestTracker>,
    pub(crate) recently_confirmed: Mutex<crate::filters::SeenCache<Hash256>>,
    pub(crate) relay_cache: Mutex<RelayCache>,
    pub(crate) most_recent_block: Mutex<Option<MostRecentBlock>>,
    pub(crate) extra_txn: Mutex<ExtraTxnBuffer>,
    pub(crate) pending_compacts: Mutex<HashMap<Hash256, PendingCompact>>,
    /// Peers currently selected for high-bandwidth compact blocks.
    pub(crate) hb_compact_peers: Mutex<VecDeque<PeerId>>,
    /// Number of outbound peers protected from chain-sync eviction.
    pub(crate) chain_sync_protected: Mutex<usize>,
    /// Peer we are initial-headers-syncing from, if any.
    pub(crate) headers_sync_peer: Mutex<Option<PeerId>>,

    /// Nonce in our version messages, for self-connect detection.
    pub(crate) local_nonce: u64,
    /// Key for deterministic per-purpose randomizers.
    randomizer_key: (u64, u64),
    /// Shutdown flag polled at natural boundaries.
    pub(crate) interrupt: AtomicBool,
}

impl PeerManager {
    pub fn new(
        config: P2pConfig,
        chain: Arc<dyn ChainManager>,
        mempool: Arc<dyn Mempool>,
        connman: Arc<dyn ConnectionManager>,
        banman: Option<Arc<dyn BanMan>>,
        filter_index: Option<Arc<dyn BlockFilterIndex>>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            config,
            chain,
            mempool,
            connman,
            banman,
            filter_index,
            peers: RwLock::new(HashMap::new()),
            addrman: Mutex::new(crate::addrman::AddrMan::new()),
            downloader: Mutex::new(BlockDownloader::new()),
            txrequest: Mutex::new(TxRequestTracker::new(rng.gen(), rng.gen())),
            recently_confirmed: Mutex::new(crate::filters::SeenCache::new(
                RECENT_CONFIRMED_CAPACITY,
            )),
            relay_cache: Mutex::new(RelayCache::default()),
            most_recent_block: Mutex::new(None),
            extra_txn: Mutex::new(ExtraTxnBuffer::default()),
            pending_compacts: Mutex::new(HashMap::new()),
            hb_compact_peers: Mutex::new(VecDeque::new()),
            chain_sync_protected: Mutex::new(0),
            headers_sync_peer: Mutex::new(None),
            local_nonce: rng.gen(),
            randomizer_key: (rng.gen(), rng.gen()),
            interrupt: AtomicBool::new(false),
        }
    }

    /// Signal shutdown; handlers bail out at their next check.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// A keyed hasher unique to `purpose`, stable for this instance.
    pub(crate) fn deterministic_randomizer(&self, purpose: u64) -> SipHasher24 {
        let mut hasher = SipHasher24::new(self.randomizer_key.0, self.randomizer_key.1);
        hasher.write_u64(purpose);
        hasher
    }

    pub(crate) fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().expect("peer map lock").get(&id).cloned()
    }

    /// Snapshot of all connected peers.
    pub(crate) fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer map lock")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.read().expect("peer map lock").len()
    }

    pub(crate) fn push(&self, peer: PeerId, message: Message) {
        self.connman.push_message(peer, message);
    }

    /// Apply misbehavior points; crossing the threshold marks the
    /// peer for discouragement and disconnects it.
    pub(crate) fn misbehaving(&self, peer: &Peer, points: i32, reason: &str) {
        let should_discourage = {
            let mut mis = peer.misbehavior.lock().expect("misbehavior lock");
            mis.score = mis.score.saturating_add(points);
            tracing::debug!(
                peer = %peer.id,
                points,
                total = mis.score,
                reason,
                "misbehaving"
            );
            if mis.score >= DISCOURAGEMENT_THRESHOLD && !mis.should_discourage {
                mis.should_discourage = true;
                true
            } else {
                false
            }
        };
        if should_discourage {
            if let Some(banman) = &self.banman {
                banman.discourage(&peer.address);
            }
            tracing::info!(peer = %peer.id, reason, "disconnecting misbehaving peer");
            self.connman.disconnect(peer.id);
        }
    }

    /// Map a block validation failure onto punishment per the error
    /// taxonomy. `via_compact_block` softens consensus failures since
    /// compact reconstruction can produce mutated blocks innocently.
    pub(crate) fn punish_for_block(
        &self,
        peer: &Peer,
        result: galvan_chain::BlockValidationResult,
        via_compact_block: bool,
    ) {
        use galvan_chain::BlockValidationResult::*;
        match result {
            Consensus | Mutated => {
                if !via_compact_block {
                    self.misbehaving(peer, 100, "invalid block");
                }
            }
            InvalidHeader | InvalidPrev | Checkpoint => {
                self.misbehaving(peer, 100, "invalid header chain");
            }
            CachedInvalid => {
                if peer.direction.is_outbound() {
                    self.misbehaving(peer, 100, "served known-invalid block");
                }
            }
            MissingPrev => {
                self.misbehaving(peer, 10, "block with unknown parent");
            }
            HeaderLowWork => {
                // Low-work headers are ignorable, not punishable.
            }
        }
    }

    /// Send a `getheaders`, rate-limited to one per response window.
    pub(crate) fn send_getheaders(
        &self,
        peer: &Peer,
        locator: galvan_chain::BlockLocator,
        stop_hash: Hash256,
        now: Duration,
    ) -> bool {
        {
            let mut state = peer.headers_state.lock().expect("headers state lock");
            if let Some(last) = state.last_getheaders {
                if now < last + crate::config::HEADERS_RESPONSE_TIME {
                    return false;
                }
            }
            state.last_getheaders = Some(now);
        }
        self.push(
            peer.id,
            Message::GetHeaders {
                locator: locator.hashes,
                stop_hash,
            },
        );
        true
    }

    // ---- connection lifecycle ----

    fn handle_peer_connected(
        &self,
        peer_id: PeerId,
        address: NetAddress,
        direction: ConnectionDirection,
        now: Duration,
        wall: i64,
    ) {
        let peer = Arc::new(Peer::new(peer_id, address, direction, now));
        tracing::debug!(peer = %peer_id, %direction, "peer connected");
        self.peers
            .write()
            .expect("peer map lock")
            .insert(peer_id, peer.clone());
        self.downloader
            .lock()
            .expect("downloader lock")
            .register_peer(peer_id, direction.is_outbound());

        if direction.is_outbound() {
            self.push(peer_id, self.build_version_message(&peer, wall));
        }
    }

    fn handle_peer_disconnected(&self, peer_id: PeerId, _now: Duration, wall: i64) {
        let Some(peer) = self
            .peers
            .write()
            .expect("peer map lock")
            .remove(&peer_id)
        else {
            return;
        };
        tracing::debug!(peer = %peer_id, "peer disconnected");

        self.downloader
            .lock()
            .expect("downloader lock")
            .remove_peer(peer_id);
        self.txrequest
            .lock()
            .expect("txrequest lock")
            .disconnected_peer(peer_id);
        self.pending_compacts
            .lock()
            .expect("pending compacts lock")
            .retain(|_, pending| pending.peer != peer_id);
        self.hb_compact_peers
            .lock()
            .expect("hb peers lock")
            .retain(|id| *id != peer_id);
        {
            let mut sync_peer = self.headers_sync_peer.lock().expect("sync peer lock");
            if *sync_peer == Some(peer_id) {
                *sync_peer = None;
            }
        }
        if peer.chain_sync.lock().expect("chain sync lock").protected {
            let mut protected = self.chain_sync_protected.lock().expect("protect lock");
            *protected = protected.saturating_sub(1);
        }

        // Record a finished useful connection so addrman keeps the
        // address fresh; done at disconnect so connection duration is
        // not observable through gossip.
        if peer.is_fully_connected()
            && !peer.direction.is_short_lived()
            && peer.direction.is_outbound()
        {
            self.with_addrman(|addrman| addrman.connected(&peer.address, wall));
        }
    }

    // ---- message dispatch ----

    fn handle_raw_message(
        &self,
        peer_id: PeerId,
        command: &str,
        payload: &[u8],
        now: Duration,
        wall: i64,
    ) {
        if self.interrupted() {
            return;
        }
        let message = match Message::decode(command, payload) {
            Ok(message) => message,
            Err(error) => {
                // Parse failures drop the message, not the peer.
                tracing::debug!(peer = %peer_id, command, %error, "undecodable message");
                if let Some(peer) = self.peer(peer_id) {
                    self.misbehaving(&peer, 20, "undecodable message");
                }
                return;
            }
        };
        self.process_message(peer_id, message, now, wall);
    }

    /// Dispatch one parsed message.
    pub fn process_message(&self, peer_id: PeerId, message: Message, now: Duration, wall: i64) {
        let Some(peer) = self.peer(peer_id) else {
            tracing::debug!(peer = %peer_id, "message for unknown peer");
            return;
        };

        // Handshake gating: before verack only negotiation messages
        // are accepted; everything else is ignored without penalty.
        if !peer.is_fully_connected() {
            match &message {
                Message::Version(_)
                | Message::Verack
                | Message::WtxidRelay
                | Message::SendAddrV2 => {}
                _ => {
                    tracing::debug!(
                        peer = %peer_id,
                        command = message.command(),
                        "ignoring message before handshake completion"
                    );
                    return;
                }
            }
        }

        match message {
            Message::Version(version) => self.handle_version(&peer, version, now, wall),
            Message::Verack => self.handle_verack(&peer, now),
            Message::WtxidRelay => self.handle_wtxidrelay(&peer),
            Message::SendAddrV2 => self.handle_sendaddrv2(&peer),
            Message::SendHeaders => self.handle_sendheaders(&peer),
            Message::SendCmpct { announce, version } => {
                self.handle_sendcmpct(&peer, announce, version)
            }
            Message::Addr(entries) => self.handle_addr_list(&peer, entries, false, now, wall),
            Message::AddrV2(entries) => self.handle_addr_list(&peer, entries, true, now, wall),
            Message::GetAddr => self.handle_getaddr(&peer, now, wall),
            Message::Inv(items) => self.handle_inv(&peer, items, now, wall),
            Message::GetData(items) => self.handle_getdata(&peer, items, now),
            Message::NotFound(items) => self.handle_notfound(&peer, items, now),
            Message::GetBlocks { locator, stop_hash } => {
                self.handle_getblocks(&peer, locator, stop_hash)
            }
            Message::GetHeaders { locator, stop_hash } => {
                self.handle_getheaders(&peer, locator, stop_hash)
            }
            Message::Headers(headers) => self.handle_headers(&peer, headers, now),
            Message::Block(block) => self.handle_block(&peer, block, now),
            Message::MerkleBlock { .. } => {
                // We never request merkle blocks; ignore.
            }
            Message::Tx(tx) => self.handle_tx(&peer, tx, now, wall),
            Message::CmpctBlock(compact) => self.handle_cmpctblock(&peer, compact, now),
            Message::GetBlockTxn {
                block_hash,
                indexes,
            } => self.handle_getblocktxn(&peer, block_hash, indexes),
            Message::BlockTxn {
                block_hash,
                transactions,
            } => self.handle_blocktxn(&peer, block_hash, transactions, now),
            Message::MempoolRequest => self.handle_mempool_request(&peer),
            Message::Ping(nonce) => self.handle_ping(&peer, nonce),
            Message::Pong(nonce) => self.handle_pong(&peer, nonce, now),
            Message::FilterLoad {
                data,
                hash_funcs,
                tweak,
                flags,
            } => self.handle_filterload(&peer, data, hash_funcs, tweak, flags),
            Message::FilterAdd { data } => self.handle_filteradd(&peer, data),
            Message::FilterClear => self.handle_filterclear(&peer),
            Message::FeeFilter(rate) => self.handle_feefilter(&peer, rate),
            Message::GetCFilters {
                filter_type,
                start_height,
                stop_hash,
            } => self.handle_getcfilters(&peer, filter_type, start_height, stop_hash),
            Message::GetCFHeaders {
                filter_type,
                start_height,
                stop_hash,
            } => self.handle_getcfheaders(&peer, filter_type, start_height, stop_hash),
            Message::GetCFCheckpt {
                filter_type,
                stop_hash,
            } => self.handle_getcfcheckpt(&peer, filter_type, stop_hash),
            Message::CFilter { .. } | Message::CFHeaders { .. } | Message::CFCheckpt { .. } => {
                // We serve filters; we do not consume them.
            }
            Message::Unknown { command, .. } => {
                tracing::debug!(peer = %peer.id, command, "ignoring unknown message");
            }
        }
    }

    // ---- public operations ----

    /// Queue a transaction announcement to every tx-relay peer that
    /// has not seen it.
    pub fn relay_transaction(&self, txid: Hash256, wtxid: Hash256) {
        for peer in self.all_peers() {
            if !peer.is_fully_connected() {
                continue;
            }
            let wtxid_relay = peer.wtxid_relay();
            let hash = if wtxid_relay { wtxid } else { txid };
            let mut guard = peer.tx_relay.lock().expect("tx relay lock");
            if let Some(relay) = guard.as_mut() {
                if relay.relay_txs && !relay.known.contains(&hash) {
                    relay.to_announce.push(hash);
                }
            }
        }
    }

    /// Manually request one block from one peer.
    pub fn fetch_block(&self, peer_id: PeerId, handle: BlockIndexHandle) -> P2pResult<()> {
        let peer = self.peer(peer_id).ok_or(P2pError::PeerNotFound(peer_id.0))?;
        if !peer.is_fully_connected() || !peer.services().can_serve_recent_blocks() {
            return Err(P2pError::CannotServeBlock);
        }
        let info = self.chain.block_info(handle);
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            if downloader.in_flight_from(&info.hash) == Some(peer_id) {
                return Err(P2pError::AlreadyRequested);
            }
            downloader.mark_block_in_flight(peer_id, info.hash, Duration::ZERO);
        }
        self.push(
            peer_id,
            Message::GetData(vec![crate::protocol::InvItem::new(
                crate::protocol::InvType::WitnessBlock,
                info.hash,
            )]),
        );
        Ok(())
    }

    // ---- validation callbacks ----

    pub(crate) fn handle_block_connected_inner(
        &self,
        block: &Block,
        _handle: BlockIndexHandle,
        now: Duration,
    ) {
        // Stop chasing anything this block confirmed.
        let mut recently = self.recently_confirmed.lock().expect("recent lock");
        let mut txrequest = self.txrequest.lock().expect("txrequest lock");
        for tx in &block.transactions {
            let txid = tx.txid();
            let wtxid = tx.wtxid();
            recently.insert(txid);
            if wtxid != txid {
                recently.insert(wtxid);
            }
            txrequest.forget_tx_hash(&txid);
            txrequest.forget_tx_hash(&wtxid);
        }
        drop(txrequest);
        drop(recently);

        self.relay_cache.lock().expect("relay cache lock").expire(now);

        // Queue the announcement on every peer.
        let hash = block.hash();
        for peer in self.all_peers() {
            let mut announce = peer.block_announce.lock().expect("block announce lock");
            announce.headers_to_send.push(hash);
            announce.inv_to_send.push(hash);
        }
    }

    fn handle_block_disconnected(&self, _block: &Block) {
        // A reorg can resurrect transactions; forget what "confirmed"
        // meant so requests are not suppressed incorrectly.
        self.recently_confirmed
            .lock()
            .expect("recent lock")
            .clear();
    }

    fn handle_new_pow_valid_block(&self, _handle: BlockIndexHandle, block: &Block) {
        let hash = block.hash();
        let compact = CompactBlock::from_block(block, rand::thread_rng().gen());
        *self.most_recent_block.lock().expect("recent block lock") = Some(MostRecentBlock {
            hash,
            compact: compact.clone(),
        });

        // Push the compact block straight to high-bandwidth peers.
        let hb_peers: Vec<PeerId> = self
            .hb_compact_peers
            .lock()
            .expect("hb peers lock")
            .iter()
            .copied()
            .collect();
        for peer_id in hb_peers {
            if let Some(peer) = self.peer(peer_id) {
                let mut announce = peer.block_announce.lock().expect("block announce lock");
                let already_known = announce.headers_to_send.contains(&hash);
                drop(announce);
                if !already_known {
                    self.push(peer_id, Message::CmpctBlock(compact.clone()));
                    peer.block_announce
                        .lock()
                        .expect("block announce lock")
                        .headers_to_send
                        .retain(|h| h != &hash);
                }
            }
        }
    }

    /// Run a closure over the address manager.
    ///
    /// The addrman lives inside the engine so that gossip, getaddr
    /// serving and feeler scheduling share one instance.
    pub fn with_addrman<R>(&self, f: impl FnOnce(&mut crate::addrman::AddrMan) -> R) -> R {
        let mut guard = self.addrman.lock().expect("addrman lock");
        f(&mut guard)
    }
}

impl NetworkEventSink for PeerManager {
    fn on_peer_connected(
        &self,
        peer: PeerId,
        address: NetAddress,
        direction: ConnectionDirection,
        now: Duration,
        wall: i64,
    ) {
        self.handle_peer_connected(peer, address, direction, now, wall);
    }

    fn on_peer_disconnected(&self, peer: PeerId, now: Duration, wall: i64) {
        self.handle_peer_disconnected(peer, now, wall);
    }

    fn on_message(&self, peer: PeerId, command: &str, payload: &[u8], now: Duration, wall: i64) {
        self.handle_raw_message(peer, command, payload, now, wall);
    }

    fn tick_send(&self, peer: PeerId, now: Duration, wall: i64) {
        self.handle_tick_send(peer, now, wall);
    }
}

impl ValidationEventSink for PeerManager {
    fn on_block_connected(&self, block: &Block, handle: BlockIndexHandle, now: Duration) {
        self.handle_block_connected_inner(block, handle, now);
    }

    fn on_block_disconnected(&self, block: &Block) {
        self.handle_block_disconnected(block);
    }

    fn on_new_pow_valid_block(&self, handle: BlockIndexHandle, block: &Block) {
        self.handle_new_pow_valid_block(handle, block);
    }
}
