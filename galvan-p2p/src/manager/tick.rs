//! Periodic per-peer work and global eviction passes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use galvan_core::{GenTxId, Hash256};

use crate::config::{
    AVG_ADDRESS_BROADCAST_INTERVAL, AVG_FEEFILTER_BROADCAST_INTERVAL,
    AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, BLOCK_STALLING_TIMEOUT, CHAIN_SYNC_TIMEOUT,
    HEADERS_RESPONSE_TIME, INBOUND_INVENTORY_BROADCAST_INTERVAL, INVENTORY_BROADCAST_MAX,
    INVENTORY_BROADCAST_PER_SECOND, MAX_ADDR_TO_SEND, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
    MAX_BLOCKS_TO_ANNOUNCE, OUTBOUND_INVENTORY_BROADCAST_INTERVAL, PING_INTERVAL,
    TIMEOUT_INTERVAL,
};
use crate::manager::PeerManager;
use crate::peer::{ConnectionDirection, Peer, PeerId};
use crate::protocol::{InvItem, InvType, Message, TimedAddress};

/// Minimum connection age before a peer may be evicted as "extra".
const MINIMUM_CONNECT_TIME: Duration = Duration::from_secs(30);

/// Draw the next event of a Poisson process with the given average.
fn poisson_next(now: Duration, average: Duration) -> Duration {
    let uniform: f64 = rand::thread_rng().gen_range(1e-9..1.0);
    now + Duration::from_secs_f64(-average.as_secs_f64() * uniform.ln())
}

impl PeerManager {
    /// Emit all due outbound work for one peer, in a fixed order.
    pub(crate) fn handle_tick_send(&self, peer_id: PeerId, now: Duration, wall: i64) {
        let Some(peer) = self.peer(peer_id) else {
            return;
        };
        if self.interrupted() {
            return;
        }

        // A peer marked for discouragement goes first.
        if peer
            .misbehavior
            .lock()
            .expect("misbehavior lock")
            .should_discourage
        {
            self.connman.disconnect(peer_id);
            return;
        }

        self.maybe_send_ping(&peer, now);
        if !peer.is_fully_connected() {
            return;
        }

        self.maybe_send_addr(&peer, now, wall);
        self.maybe_announce_blocks(&peer, now);
        self.maybe_send_tx_inventory(&peer, now);
        self.check_inflight_timeouts(&peer, now);
        self.check_headers_sync_timeout(&peer, now);
        self.consider_eviction(&peer, now);
        self.request_blocks(&peer, now);
        self.request_due_txs(&peer, now);
        self.maybe_send_feefilter(&peer, now);
    }

    fn maybe_send_ping(&self, peer: &Peer, now: Duration) {
        let mut ping = peer.ping.lock().expect("ping lock");
        if let (Some(_), Some(sent_at)) = (ping.nonce, ping.sent_at) {
            if now.saturating_sub(sent_at) > TIMEOUT_INTERVAL {
                drop(ping);
                tracing::debug!(peer = %peer.id, "ping timeout");
                self.connman.disconnect(peer.id);
                return;
            }
            return;
        }
        let due = match ping.next_ping {
            Some(next) => now >= next,
            None => true,
        };
        if due && peer.is_fully_connected() {
            let nonce: u64 = rand::thread_rng().gen_range(1..u64::MAX);
            ping.nonce = Some(nonce);
            ping.sent_at = Some(now);
            ping.next_ping = Some(now + PING_INTERVAL);
            drop(ping);
            self.push(peer.id, Message::Ping(nonce));
        }
    }

    pub(crate) fn handle_ping(&self, peer: &Peer, nonce: u64) {
        self.push(peer.id, Message::Pong(nonce));
    }

    pub(crate) fn handle_pong(&self, peer: &Peer, nonce: u64, now: Duration) {
        let mut ping = peer.ping.lock().expect("ping lock");
        match ping.nonce {
            Some(expected) if expected == nonce => {
                if let Some(sent_at) = ping.sent_at {
                    let rtt = now.saturating_sub(sent_at);
                    ping.best_rtt = Some(match ping.best_rtt {
                        Some(best) => best.min(rtt),
                        None => rtt,
                    });
                }
                ping.nonce = None;
                ping.sent_at = None;
            }
            Some(_) if nonce == 0 => {
                // A zero-nonce pong cancels the outstanding ping.
                ping.nonce = None;
                ping.sent_at = None;
            }
            Some(expected) => {
                tracing::debug!(peer = %peer.id, expected, got = nonce, "pong nonce mismatch");
            }
            None => {
                tracing::debug!(peer = %peer.id, "unsolicited pong");
            }
        }
    }

    fn maybe_send_addr(&self, peer: &Peer, now: Duration, wall: i64) {
        let mut to_send: Vec<TimedAddress> = Vec::new();
        let mut use_v2 = false;
        {
            let mut guard = peer.addr_relay.lock().expect("addr relay lock");
            let Some(relay) = guard.as_mut() else {
                return;
            };

            // Self-advertisement on its own slow clock.
            if let Some(local) = &self.config.local_address {
                let due = match relay.next_local_send {
                    Some(next) => now >= next,
                    None => true,
                };
                if due {
                    relay.next_local_send =
                        Some(poisson_next(now, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL));
                    let entry = TimedAddress {
                        time: wall.clamp(0, u32::MAX as i64) as u32,
                        services: self.config.local_services,
                        address: local.clone(),
                    };
                    let mut rng = rand::thread_rng();
                    relay.push_addr(entry, &mut rng);
                }
            }

            let due = match relay.next_send {
                Some(next) => now >= next,
                None => {
                    relay.next_send = Some(poisson_next(now, AVG_ADDRESS_BROADCAST_INTERVAL));
                    false
                }
            };
            if !due || relay.to_send.is_empty() {
                return;
            }
            relay.next_send = Some(poisson_next(now, AVG_ADDRESS_BROADCAST_INTERVAL));

            for entry in relay.to_send.drain(..) {
                relay.known.insert(entry.address.identity_key());
                to_send.push(entry);
                if to_send.len() >= MAX_ADDR_TO_SEND {
                    break;
                }
            }
            use_v2 = peer.handshake.lock().expect("handshake lock").wants_addrv2;
            if !use_v2 {
                // Legacy peers can only be told about v1 addresses.
                to_send.retain(|entry| entry.address.is_addr_v1_compatible());
            }
        }
        if to_send.is_empty() {
            return;
        }
        let message = if use_v2 {
            Message::AddrV2(to_send)
        } else {
            Message::Addr(to_send)
        };
        self.push(peer.id, message);
    }

    /// Announce queued blocks: compact block for a lone block to a
    /// high-bandwidth peer, headers for peers that prefer them, inv
    /// otherwise.
    fn maybe_announce_blocks(&self, peer: &Peer, _now: Duration) {
        let (headers_queue, inv_queue) = {
            let mut announce = peer.block_announce.lock().expect("block announce lock");
            if announce.headers_to_send.is_empty() && announce.inv_to_send.is_empty() {
                return;
            }
            (
                std::mem::take(&mut announce.headers_to_send),
                std::mem::take(&mut announce.inv_to_send),
            )
        };

        let (prefers_headers, wants_hb, provides_cmpct) = {
            let handshake = peer.handshake.lock().expect("handshake lock");
            (
                handshake.prefers_headers,
                handshake.wants_cmpct_hb,
                handshake.provides_cmpctblocks,
            )
        };

        if prefers_headers {
            // One fresh block to a high-bandwidth compact peer goes
            // out as the compact block itself.
            if headers_queue.len() == 1 && wants_hb && provides_cmpct {
                let cached = self.most_recent_block.lock().expect("recent block lock");
                if let Some(recent) = cached.as_ref() {
                    if recent.hash == headers_queue[0] {
                        let compact = recent.compact.clone();
                        drop(cached);
                        self.push(peer.id, Message::CmpctBlock(compact));
                        return;
                    }
                }
            }
            if headers_queue.len() <= MAX_BLOCKS_TO_ANNOUNCE {
                let mut headers = Vec::with_capacity(headers_queue.len());
                for hash in &headers_queue {
                    if let Some(handle) = self.chain.lookup_block_index(hash) {
                        headers.push(self.chain.block_info(handle).header);
                    }
                }
                if !headers.is_empty() {
                    self.push(peer.id, Message::Headers(headers));
                }
                return;
            }
            // Too many: fall through to a tip inv.
        }

        if let Some(hash) = inv_queue.last().or(headers_queue.last()) {
            self.push(
                peer.id,
                Message::Inv(vec![InvItem::new(InvType::Block, *hash)]),
            );
        }
    }

    fn maybe_send_tx_inventory(&self, peer: &Peer, now: Duration) {
        let wtxid_relay = peer.wtxid_relay();
        let mut items: Vec<InvItem> = Vec::new();
        {
            let mut guard = peer.tx_relay.lock().expect("tx relay lock");
            let Some(relay) = guard.as_mut() else {
                return;
            };
            if !relay.relay_txs {
                relay.to_announce.clear();
                return;
            }

            let average = if peer.direction.is_outbound() {
                OUTBOUND_INVENTORY_BROADCAST_INTERVAL
            } else {
                INBOUND_INVENTORY_BROADCAST_INTERVAL
            };
            let due = match relay.next_inv_send {
                Some(next) => now >= next,
                None => {
                    relay.next_inv_send = Some(poisson_next(now, average));
                    false
                }
            };
            if !due {
                return;
            }
            relay.next_inv_send = Some(poisson_next(now, average));

            // Whole-mempool announcement after a `mempool` request.
            if relay.send_mempool {
                relay.send_mempool = false;
                for info in self.mempool.info_all() {
                    if info.fee_rate() < relay.fee_filter {
                        continue;
                    }
                    let hash = if wtxid_relay {
                        info.tx.wtxid()
                    } else {
                        info.tx.txid()
                    };
                    if let Some(bloom) = &relay.bloom {
                        if !bloom.is_relevant(&info.tx, &info.tx.txid()) {
                            continue;
                        }
                    }
                    relay.known.insert(hash);
                    items.push(InvItem::new(
                        if wtxid_relay { InvType::WTx } else { InvType::Tx },
                        hash,
                    ));
                }
            }

            // Refill the trickle token bucket.
            if let Some(last) = relay.last_refill {
                let elapsed = now.saturating_sub(last).as_secs_f64();
                relay.token_bucket = (relay.token_bucket
                    + elapsed * INVENTORY_BROADCAST_PER_SECOND as f64)
                    .min(INVENTORY_BROADCAST_MAX as f64);
            }
            relay.last_refill = Some(now);

            let mut kept = Vec::new();
            let queued = std::mem::take(&mut relay.to_announce);
            for hash in queued {
                if relay.token_bucket < 1.0 {
                    kept.push(hash);
                    continue;
                }
                if relay.known.contains(&hash) {
                    continue;
                }
                let gtxid = if wtxid_relay {
                    GenTxId::Wtxid(hash)
                } else {
                    GenTxId::Txid(hash)
                };
                let Some(info) = self.mempool.info(&gtxid) else {
                    continue;
                };
                if info.fee_rate() < relay.fee_filter {
                    continue;
                }
                if let Some(bloom) = &relay.bloom {
                    if !bloom.is_relevant(&info.tx, &info.tx.txid()) {
                        continue;
                    }
                }
                relay.token_bucket -= 1.0;
                relay.known.insert(hash);
                items.push(InvItem::new(
                    if wtxid_relay { InvType::WTx } else { InvType::Tx },
                    hash,
                ));
            }
            relay.to_announce = kept;
        }
        if !items.is_empty() {
            self.push(peer.id, Message::Inv(items));
        }
    }

    fn check_inflight_timeouts(&self, peer: &Peer, now: Duration) {
        let spacing = self.chain.pow_target_spacing();
        let timed_out = {
            let downloader = self.downloader.lock().expect("downloader lock");
            downloader.timed_out_blocks(now, spacing)
        };
        for (owner, hash) in timed_out {
            if owner == peer.id {
                tracing::info!(peer = %peer.id, hash = ?&hash[..8], "block download timeout");
                self.connman.disconnect(peer.id);
                return;
            }
        }
    }

    fn check_headers_sync_timeout(&self, peer: &Peer, now: Duration) {
        let overdue = {
            let state = peer.headers_state.lock().expect("headers state lock");
            matches!(state.sync_timeout, Some(deadline) if now > deadline)
        };
        if !overdue {
            return;
        }
        if self.peer_count() > 1 {
            tracing::info!(peer = %peer.id, "headers sync timeout, disconnecting");
            self.connman.disconnect(peer.id);
        } else {
            // Last peer standing: let it keep trying.
            let mut state = peer.headers_state.lock().expect("headers state lock");
            state.sync_timeout = None;
            state.sync = None;
            let mut sync_peer = self.headers_sync_peer.lock().expect("sync peer lock");
            if *sync_peer == Some(peer.id) {
                *sync_peer = None;
            }
        }
    }

    /// Evict outbound peers whose chains stay behind ours: one
    /// warning `getheaders`, then a response window, then the axe.
    pub(crate) fn consider_eviction(&self, peer: &Peer, now: Duration) {
        if !peer.direction.is_outbound() || peer.direction.is_short_lived() {
            return;
        }
        let Some(tip) = self.chain.active_tip() else {
            return;
        };
        let tip_info = self.chain.block_info(tip);

        let best_known_work = {
            let downloader = self.downloader.lock().expect("downloader lock");
            downloader
                .peer(peer.id)
                .and_then(|state| state.best_known_block)
                .map(|handle| self.chain.block_info(handle).chainwork)
        };

        let mut chain_sync = peer.chain_sync.lock().expect("chain sync lock");
        if chain_sync.protected {
            return;
        }
        if matches!(best_known_work, Some(work) if work >= tip_info.chainwork) {
            chain_sync.timeout = None;
            chain_sync.work_header = None;
            chain_sync.sent_getheaders = false;
            return;
        }
        match chain_sync.timeout {
            None => {
                chain_sync.timeout = Some(now + CHAIN_SYNC_TIMEOUT);
                chain_sync.work_header = Some(tip);
            }
            Some(deadline) if now > deadline => {
                if chain_sync.sent_getheaders {
                    drop(chain_sync);
                    tracing::info!(peer = %peer.id, "chain-sync timeout, disconnecting lagging peer");
                    self.connman.disconnect(peer.id);
                } else {
                    chain_sync.sent_getheaders = true;
                    chain_sync.timeout = Some(now + HEADERS_RESPONSE_TIME);
                    let locator_root = chain_sync.work_header;
                    drop(chain_sync);
                    let locator = self.chain.get_locator(locator_root);
                    // One warning request, outside the normal window.
                    peer.headers_state
                        .lock()
                        .expect("headers state lock")
                        .last_getheaders = None;
                    self.send_getheaders(peer, locator, galvan_core::ZERO_HASH, now);
                }
            }
            Some(_) => {}
        }
    }

    /// Fill this peer's block-download slots.
    pub(crate) fn request_blocks(&self, peer: &Peer, now: Duration) {
        if !peer.is_fully_connected()
            || peer.direction.is_short_lived()
            || !peer.services().can_serve_recent_blocks()
        {
            return;
        }
        let (to_fetch, staller) = {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            let slots =
                MAX_BLOCKS_IN_TRANSIT_PER_PEER.saturating_sub(downloader.in_flight_count(peer.id));
            let next = downloader.find_next_blocks_to_download(peer.id, self.chain.as_ref(), slots);
            let mut hashes = Vec::with_capacity(next.to_fetch.len());
            for handle in next.to_fetch {
                let hash = self.chain.block_info(handle).hash;
                if downloader.mark_block_in_flight(peer.id, hash, now) {
                    hashes.push(hash);
                }
            }
            if !hashes.is_empty() {
                if let Some(state) = downloader.peer_mut(peer.id) {
                    state.stalling_since = None;
                }
            }
            (hashes, next.staller)
        };

        if let Some(staller) = staller {
            self.note_staller(staller, now);
        }

        if !to_fetch.is_empty() {
            let items: Vec<InvItem> = to_fetch
                .iter()
                .map(|hash| InvItem::new(InvType::WitnessBlock, *hash))
                .collect();
            tracing::debug!(peer = %peer.id, count = items.len(), "requesting blocks");
            self.push(peer.id, Message::GetData(items));
        }
    }

    /// Track the peer blocking the download window; two seconds of
    /// blockage disconnects it.
    fn note_staller(&self, staller: PeerId, now: Duration) {
        let should_disconnect = {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            match downloader.peer_mut(staller) {
                Some(state) => match state.stalling_since {
                    None => {
                        state.stalling_since = Some(now);
                        false
                    }
                    Some(since) => now.saturating_sub(since) > BLOCK_STALLING_TIMEOUT,
                },
                None => false,
            }
        };
        if should_disconnect {
            tracing::info!(peer = %staller, "peer is stalling block download, disconnecting");
            self.connman.disconnect(staller);
        }
    }

    fn maybe_send_feefilter(&self, peer: &Peer, now: Duration) {
        if !self.config.tx_relay {
            return;
        }
        let min_fee = self.mempool.min_fee_rate();
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        let Some(relay) = guard.as_mut() else {
            return;
        };
        let due = match relay.next_feefilter_send {
            Some(next) => now >= next,
            None => true,
        };
        if !due {
            return;
        }
        relay.next_feefilter_send = Some(poisson_next(now, AVG_FEEFILTER_BROADCAST_INTERVAL));
        let changed = relay.last_feefilter_sent != min_fee;
        if changed {
            relay.last_feefilter_sent = min_fee;
        }
        drop(guard);
        if changed {
            self.push(peer.id, Message::FeeFilter(min_fee));
        }
    }

    pub(crate) fn handle_feefilter(&self, peer: &Peer, rate: i64) {
        if rate < 0 {
            // Out-of-range fee rates are ignored.
            return;
        }
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        if let Some(relay) = guard.as_mut() {
            relay.fee_filter = rate;
        }
    }

    // ---- bloom filter handlers ----

    pub(crate) fn handle_filterload(
        &self,
        peer: &Peer,
        data: Vec<u8>,
        hash_funcs: u32,
        tweak: u32,
        flags: u8,
    ) {
        if !crate::peer::ServiceFlags::from_bits(self.config.local_services)
            .contains(crate::peer::ServiceFlags::BLOOM)
        {
            tracing::debug!(peer = %peer.id, "filterload without bloom service");
            self.connman.disconnect(peer.id);
            return;
        }
        let filter = crate::filters::BloomFilter::from_load(data, hash_funcs, tweak);
        if !filter.is_within_size_constraints() {
            self.misbehaving(peer, 100, "oversized bloom filter");
            return;
        }
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        if let Some(relay) = guard.as_mut() {
            relay.bloom = Some(filter);
            // Loading a filter implies the peer wants tx relay.
            relay.relay_txs = true;
        }
        let _ = flags;
    }

    pub(crate) fn handle_filteradd(&self, peer: &Peer, data: Vec<u8>) {
        if !crate::peer::ServiceFlags::from_bits(self.config.local_services)
            .contains(crate::peer::ServiceFlags::BLOOM)
        {
            self.connman.disconnect(peer.id);
            return;
        }
        if data.len() > crate::filters::bloom::MAX_FILTER_ADD_SIZE {
            self.misbehaving(peer, 100, "oversized filteradd element");
            return;
        }
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        match guard.as_mut().and_then(|relay| relay.bloom.as_mut()) {
            Some(bloom) => bloom.insert(&data),
            None => {
                drop(guard);
                self.misbehaving(peer, 100, "filteradd without loaded filter");
            }
        }
    }

    pub(crate) fn handle_filterclear(&self, peer: &Peer) {
        if !crate::peer::ServiceFlags::from_bits(self.config.local_services)
            .contains(crate::peer::ServiceFlags::BLOOM)
        {
            self.connman.disconnect(peer.id);
            return;
        }
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        if let Some(relay) = guard.as_mut() {
            relay.bloom = None;
        }
    }

    // ---- scheduler entry points ----

    /// Stale-tip and extra-peer housekeeping; the outer scheduler
    /// calls this every 45 seconds.
    pub fn check_stale_tip_and_evict_peers(&self, now: Duration, wall: i64) {
        self.evict_extra_full_relay_peers(now);
        self.evict_extra_block_relay_peers(now);

        // Lazy addrman collision resolution, plus a feeler for any
        // incumbent that still needs testing.
        let feeler = self.with_addrman(|addrman| {
            addrman.resolve_collisions(wall);
            addrman.select_tried_collision()
        });
        if let Some((address, _last_try)) = feeler {
            self.connman.start_feeler(address);
        }
    }

    fn evict_extra_full_relay_peers(&self, now: Duration) {
        let full_relay: Vec<Arc<Peer>> = self
            .all_peers()
            .into_iter()
            .filter(|p| p.direction == ConnectionDirection::OutboundFullRelay)
            .collect();
        if full_relay.len() <= self.config.max_outbound_full_relay {
            return;
        }

        // Oldest block announcement goes first; ties to the higher id.
        let mut victim: Option<(Option<Duration>, PeerId)> = None;
        for peer in &full_relay {
            if peer.chain_sync.lock().expect("chain sync lock").protected {
                continue;
            }
            if now.saturating_sub(peer.connected_at) < MINIMUM_CONNECT_TIME {
                continue;
            }
            if self
                .downloader
                .lock()
                .expect("downloader lock")
                .in_flight_count(peer.id)
                > 0
            {
                continue;
            }
            let last_announcement = *peer
                .last_block_announcement
                .lock()
                .expect("last announcement lock");
            let candidate = (last_announcement, peer.id);
            victim = Some(match victim {
                None => candidate,
                Some(current) => {
                    if candidate.0 < current.0
                        || (candidate.0 == current.0 && candidate.1 > current.1)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        if let Some((_, id)) = victim {
            tracing::info!(peer = %id, "evicting extra outbound full-relay peer");
            self.connman.disconnect(id);
        }
    }

    fn evict_extra_block_relay_peers(&self, now: Duration) {
        let block_relay: Vec<Arc<Peer>> = self
            .all_peers()
            .into_iter()
            .filter(|p| p.direction == ConnectionDirection::BlockRelayOnly)
            .collect();
        if block_relay.len() <= self.config.max_outbound_block_relay {
            return;
        }

        // Youngest goes, preferring one that never gave us a block.
        let mut victim: Option<(bool, Duration, PeerId)> = None;
        for peer in &block_relay {
            if now.saturating_sub(peer.connected_at) < MINIMUM_CONNECT_TIME {
                continue;
            }
            let gave_block = peer
                .last_block_time
                .lock()
                .expect("last block lock")
                .is_some();
            // Sort key: blockless first, then youngest.
            let candidate = (gave_block, peer.connected_at, peer.id);
            victim = Some(match victim {
                None => (candidate.0, candidate.1, candidate.2),
                Some(current) => {
                    let better = (!candidate.0 && current.0)
                        || (candidate.0 == current.0 && candidate.1 > current.1);
                    if better {
                        (candidate.0, candidate.1, candidate.2)
                    } else {
                        current
                    }
                }
            });
        }
        if let Some((_, _, id)) = victim {
            tracing::info!(peer = %id, "evicting extra block-relay-only peer");
            self.connman.disconnect(id);
        }
    }

    /// Re-announce mempool transactions no peer has echoed back; the
    /// outer scheduler calls this every 10–15 minutes.
    pub fn reattempt_initial_broadcast(&self) {
        let unbroadcast = self.mempool.unbroadcast();
        let count = unbroadcast.len();
        for (txid, wtxid) in unbroadcast {
            if self.mempool.exists(&GenTxId::Txid(txid)) {
                self.relay_transaction(txid, wtxid);
            } else {
                self.mempool.remove_unbroadcast(&txid);
            }
        }
        if count > 0 {
            tracing::debug!(count, "reattempted initial broadcast");
        }
    }

    /// Expire the short-lived relay cache (scheduler hygiene).
    pub fn expire_relay_cache(&self, now: Duration) {
        self.relay_cache.lock().expect("relay cache lock").expire(now);
    }

    /// Test and integration support: direct read of a peer's
    /// misbehavior score.
    pub fn misbehavior_score(&self, peer: PeerId) -> Option<i32> {
        self.peer(peer)
            .map(|p| p.misbehavior.lock().expect("misbehavior lock").score)
    }

    /// Whether a block is currently in flight, and from which peer.
    pub fn block_in_flight_from(&self, hash: &Hash256) -> Option<PeerId> {
        self.downloader
            .lock()
            .expect("downloader lock")
            .in_flight_from(hash)
    }
}
