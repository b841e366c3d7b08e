//! Headers relay, block delivery, compact blocks and compact filter
//! serving.

use std::time::Duration;

use galvan_chain::{BlockIndexHandle, BlockProcessResult, Work};
use galvan_core::{Block, BlockHeader, Hash256, Transaction, ZERO_HASH};

use crate::config::{
    MAX_BLOCKS_TO_ANNOUNCE, MAX_BLOCKTXN_DEPTH, MAX_GETCFHEADERS_SIZE, MAX_GETCFILTERS_SIZE,
    MAX_HEADERS_RESULTS, MAX_LOCATOR_SZ, MAX_UNCONNECTING_HEADERS, CFCHECKPT_INTERVAL,
};
use crate::manager::{PeerManager, PendingCompact};
use crate::peer::Peer;
use crate::protocol::messages::{short_id, CompactBlock};
use crate::protocol::{InvItem, InvType, Message};
use crate::sync::headers::HeadersSyncState;

/// Blocks behind the tip in one `getblocks` inv batch.
const GETBLOCKS_LIMIT: usize = 500;

impl PeerManager {
    /// Work a peer's chain must claim before headers are stored:
    /// whichever is higher of the static floor and "near our tip".
    pub(crate) fn anti_dos_work_threshold(&self) -> Work {
        let minimum = self.chain.minimum_chain_work();
        let near_tip = self
            .chain
            .active_tip()
            .map(|tip| {
                let info = self.chain.block_info(tip);
                let single = info.header.work();
                info.chainwork.checked_sub(single * 144u64).unwrap_or_default()
            })
            .unwrap_or_else(Work::zero);
        minimum.max(near_tip)
    }

    fn headers_are_continuous(headers: &[BlockHeader]) -> bool {
        headers
            .windows(2)
            .all(|pair| pair[1].prev_blockhash == pair[0].hash())
    }

    pub(crate) fn handle_headers(&self, peer: &Peer, headers: Vec<BlockHeader>, now: Duration) {
        if headers.len() > MAX_HEADERS_RESULTS {
            self.misbehaving(peer, 20, "oversized headers message");
            return;
        }
        let full_batch = headers.len() == MAX_HEADERS_RESULTS;

        // An active anti-DoS sync consumes the message first.
        let sync_result = {
            let mut state = peer.headers_state.lock().expect("headers state lock");
            state
                .sync
                .as_mut()
                .map(|sync| (sync.process_next_headers(&headers, full_batch), sync.is_final()))
        };
        if let Some((result, finished)) = sync_result {
            if !result.success {
                self.clear_headers_sync(peer);
                self.misbehaving(peer, 100, "invalid anti-DoS headers sequence");
                return;
            }
            if result.request_more {
                let locator = {
                    let state = peer.headers_state.lock().expect("headers state lock");
                    state
                        .sync
                        .as_ref()
                        .map(|sync| sync.next_headers_request_locator())
                };
                if let Some(locator) = locator {
                    // Sync continuations bypass the response window.
                    peer.headers_state
                        .lock()
                        .expect("headers state lock")
                        .last_getheaders = None;
                    self.send_getheaders(peer, locator, ZERO_HASH, now);
                }
            }
            if finished {
                self.clear_headers_sync(peer);
            }
            if result.pow_validated_headers.is_empty() {
                return;
            }
            // Validated headers continue into the storage path.
            self.accept_headers(peer, result.pow_validated_headers, true, now);
            return;
        }

        if headers.is_empty() {
            return;
        }
        if !Self::headers_are_continuous(&headers) {
            self.misbehaving(peer, 20, "non-continuous headers");
            return;
        }

        // Unconnecting headers: probe with getheaders, and charge the
        // peer when it keeps happening.
        if self
            .chain
            .lookup_block_index(&headers[0].prev_blockhash)
            .is_none()
        {
            if headers.len() <= MAX_BLOCKS_TO_ANNOUNCE {
                let count = {
                    let mut state = peer.headers_state.lock().expect("headers state lock");
                    state.unconnecting_count += 1;
                    // The probe must go out every time.
                    state.last_getheaders = None;
                    state.unconnecting_count
                };
                self.send_getheaders(peer, self.tip_locator(), ZERO_HASH, now);
                {
                    let mut downloader = self.downloader.lock().expect("downloader lock");
                    downloader.update_block_availability(
                        peer.id,
                        headers.last().expect("non-empty").hash(),
                        self.chain.as_ref(),
                    );
                }
                if count % MAX_UNCONNECTING_HEADERS == 0 {
                    self.misbehaving(peer, 20, "repeated unconnecting headers");
                }
            } else {
                tracing::debug!(
                    peer = %peer.id,
                    count = headers.len(),
                    "discarding large unconnecting headers batch"
                );
            }
            return;
        }

        // Headers connect. Low-work chains are not stored; a full
        // batch may instead start the two-phase anti-DoS sync.
        let parent = self
            .chain
            .lookup_block_index(&headers[0].prev_blockhash)
            .expect("checked above");
        let parent_info = self.chain.block_info(parent);
        let claimed: Work = headers
            .iter()
            .fold(parent_info.chainwork, |acc, h| acc + h.work());
        if claimed < self.anti_dos_work_threshold() {
            if full_batch {
                let mut sync = HeadersSyncState::new(
                    peer.id,
                    parent_info.hash,
                    parent_info.height,
                    parent_info.chainwork,
                    self.anti_dos_work_threshold(),
                );
                let result = sync.process_next_headers(&headers, true);
                if !result.success {
                    self.misbehaving(peer, 100, "invalid headers in presync batch");
                    return;
                }
                tracing::debug!(peer = %peer.id, "entering headers presync");
                let locator = sync.next_headers_request_locator();
                {
                    let mut state = peer.headers_state.lock().expect("headers state lock");
                    state.sync = Some(sync);
                    state.last_getheaders = None;
                }
                if result.request_more {
                    self.send_getheaders(peer, locator, ZERO_HASH, now);
                }
            } else {
                tracing::debug!(peer = %peer.id, "ignoring low-work headers");
            }
            return;
        }

        self.accept_headers(peer, headers, true, now);
    }

    fn clear_headers_sync(&self, peer: &Peer) {
        let mut state = peer.headers_state.lock().expect("headers state lock");
        state.sync = None;
        state.sync_timeout = None;
        let mut sync_peer = self.headers_sync_peer.lock().expect("sync peer lock");
        if *sync_peer == Some(peer.id) {
            *sync_peer = None;
        }
    }

    /// Store connecting, sufficiently-worked headers and react:
    /// continuation requests, eviction-timeout satisfaction, direct
    /// block fetch.
    fn accept_headers(
        &self,
        peer: &Peer,
        headers: Vec<BlockHeader>,
        min_pow_checked: bool,
        now: Duration,
    ) {
        let count = headers.len();
        let last = match self.chain.process_new_block_headers(&headers, min_pow_checked) {
            Ok(last) => last,
            Err(result) => {
                self.punish_for_block(peer, result, false);
                return;
            }
        };

        {
            let mut state = peer.headers_state.lock().expect("headers state lock");
            state.unconnecting_count = 0;
            state.sync_timeout = None;
        }
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            let last_hash = self.chain.block_info(last).hash;
            downloader.update_block_availability(peer.id, last_hash, self.chain.as_ref());
        }

        // A full batch means there is more where that came from.
        if count == MAX_HEADERS_RESULTS {
            let locator = self.chain.get_locator(Some(last));
            peer.headers_state
                .lock()
                .expect("headers state lock")
                .last_getheaders = None;
            self.send_getheaders(peer, locator, ZERO_HASH, now);
        }

        let last_work = self.chain.block_info(last).chainwork;
        let tip_work = self
            .chain
            .active_tip()
            .map(|tip| self.chain.block_info(tip).chainwork)
            .unwrap_or_else(Work::zero);

        // The peer proved a competitive chain: stand down any pending
        // eviction, and protect early provers.
        if last_work >= tip_work {
            let mut chain_sync = peer.chain_sync.lock().expect("chain sync lock");
            chain_sync.timeout = None;
            chain_sync.work_header = None;
            chain_sync.sent_getheaders = false;
            if peer.direction.is_outbound() && !chain_sync.protected {
                let mut protected = self.chain_sync_protected.lock().expect("protect lock");
                if *protected < crate::config::MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT {
                    chain_sync.protected = true;
                    *protected += 1;
                }
            }
        }

        // Pull any now-fetchable blocks without waiting for the tick.
        self.request_blocks(peer, now);
        tracing::debug!(peer = %peer.id, count, "accepted headers");
    }

    pub(crate) fn handle_getheaders(
        &self,
        peer: &Peer,
        locator: Vec<Hash256>,
        stop_hash: Hash256,
    ) {
        if locator.len() > MAX_LOCATOR_SZ {
            tracing::debug!(peer = %peer.id, len = locator.len(), "oversized locator");
            self.connman.disconnect(peer.id);
            return;
        }
        if self.chain.is_initial_block_download() {
            // Our headers are not worth fingerprinting during IBD.
            tracing::debug!(peer = %peer.id, "ignoring getheaders during IBD");
            return;
        }

        let mut headers = Vec::new();
        if locator.is_empty() {
            // Single-header request by hash.
            if let Some(handle) = self.chain.lookup_block_index(&stop_hash) {
                if self.chain.in_active_chain(handle) {
                    headers.push(self.chain.block_info(handle).header);
                }
            }
        } else {
            let fork = self.chain.find_fork_in_global_index(&galvan_chain::BlockLocator {
                hashes: locator,
            });
            let start_height = fork
                .map(|handle| self.chain.block_info(handle).height + 1)
                .unwrap_or(0);
            let mut height = start_height;
            while let Some(handle) = self.chain.active_at_height(height) {
                let info = self.chain.block_info(handle);
                headers.push(info.header);
                if headers.len() >= MAX_HEADERS_RESULTS || info.hash == stop_hash {
                    break;
                }
                height += 1;
            }
        }
        self.push(peer.id, Message::Headers(headers));
    }

    pub(crate) fn handle_getblocks(
        &self,
        peer: &Peer,
        locator: Vec<Hash256>,
        stop_hash: Hash256,
    ) {
        if locator.len() > MAX_LOCATOR_SZ {
            tracing::debug!(peer = %peer.id, len = locator.len(), "oversized locator");
            self.connman.disconnect(peer.id);
            return;
        }
        if self.chain.is_initial_block_download() {
            return;
        }

        let fork = self.chain.find_fork_in_global_index(&galvan_chain::BlockLocator {
            hashes: locator,
        });
        let mut height = fork
            .map(|handle| self.chain.block_info(handle).height + 1)
            .unwrap_or(0);

        let mut announce = peer.block_announce.lock().expect("block announce lock");
        let mut sent = 0usize;
        while let Some(handle) = self.chain.active_at_height(height) {
            let info = self.chain.block_info(handle);
            announce.inv_to_send.push(info.hash);
            sent += 1;
            if info.hash == stop_hash {
                break;
            }
            if sent >= GETBLOCKS_LIMIT {
                // Remember where to resume when the peer fetches the
                // last announced block.
                announce.continuation_block = Some(info.hash);
                break;
            }
            height += 1;
        }
    }

    /// Shared block-delivery path for `block` and reconstructed
    /// compact blocks.
    pub(crate) fn process_incoming_block(
        &self,
        peer: &Peer,
        block: Block,
        via_compact_block: bool,
        now: Duration,
    ) {
        let hash = block.hash();
        self.pending_compacts
            .lock()
            .expect("pending compacts lock")
            .remove(&hash);

        let forced = {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            let owner = downloader.in_flight_from(&hash);
            downloader.mark_block_received(&hash);
            owner == Some(peer.id)
        };

        // Unsolicited blocks must at least plausibly extend a chain
        // with competitive work.
        let min_pow_checked = forced
            || via_compact_block
            || self
                .chain
                .lookup_block_index(&block.header.prev_blockhash)
                .map(|parent| {
                    self.chain.block_info(parent).chainwork + block.header.work()
                        >= self.anti_dos_work_threshold()
                })
                .unwrap_or(false);
        if !forced && !min_pow_checked {
            tracing::debug!(peer = %peer.id, "ignoring unsolicited low-work block");
            return;
        }

        *peer.last_block_time.lock().expect("last block lock") = Some(now);

        match self.chain.process_new_block(&block, forced, min_pow_checked) {
            BlockProcessResult::Accepted(handle) => {
                tracing::info!(
                    peer = %peer.id,
                    height = self.chain.block_info(handle).height,
                    "new block accepted"
                );
                self.handle_block_connected_inner(&block, handle, now);
            }
            BlockProcessResult::AlreadyHave(_) => {}
            BlockProcessResult::Invalid(result) => {
                self.punish_for_block(peer, result, via_compact_block);
            }
        }
    }

    pub(crate) fn handle_block(&self, peer: &Peer, block: Block, now: Duration) {
        self.process_incoming_block(peer, block, false, now);
    }

    pub(crate) fn handle_cmpctblock(&self, peer: &Peer, compact: CompactBlock, now: Duration) {
        let header = compact.header;
        if !header.check_pow() {
            self.misbehaving(peer, 100, "compact block with invalid PoW");
            return;
        }
        let Some(parent) = self.chain.lookup_block_index(&header.prev_blockhash) else {
            // Cannot place it: fetch headers first.
            self.send_getheaders(peer, self.tip_locator(), ZERO_HASH, now);
            return;
        };
        let parent_info = self.chain.block_info(parent);
        if parent_info.chainwork + header.work() < self.anti_dos_work_threshold() {
            tracing::debug!(peer = %peer.id, "ignoring low-work compact block");
            return;
        }
        if let Err(result) = self.chain.process_new_block_headers(&[header], true) {
            self.punish_for_block(peer, result, true);
            return;
        }

        let hash = header.hash();
        *peer
            .last_block_announcement
            .lock()
            .expect("last announcement lock") = Some(now);
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            downloader.update_block_availability(peer.id, hash, self.chain.as_ref());
        }
        if let Some(handle) = self.chain.lookup_block_index(&hash) {
            if self.chain.block_info(handle).have_data {
                return;
            }
        }

        let total = compact.total_tx_count();
        if total == 0 || total > crate::config::MAX_CMPCTBLOCK_TXN {
            self.misbehaving(peer, 100, "malformed compact block");
            return;
        }
        for prefilled in &compact.prefilled {
            if prefilled.index as usize >= total {
                self.misbehaving(peer, 100, "compact block prefilled index out of range");
                return;
            }
        }

        // Reconstruct from prefilled txs, the mempool and the extra
        // pool.
        let mut recovered: Vec<Option<Transaction>> = vec![None; total];
        for prefilled in &compact.prefilled {
            recovered[prefilled.index as usize] = Some(prefilled.tx.clone());
        }

        let (k0, k1) = compact.short_id_keys();
        let mut id_to_index = std::collections::HashMap::new();
        for (offset, short) in compact.short_ids.iter().enumerate() {
            // Map each short ID onto its block position, skipping
            // prefilled slots.
            let mut position = 0usize;
            let mut remaining = offset;
            loop {
                if recovered[position].is_none() {
                    if remaining == 0 {
                        break;
                    }
                    remaining -= 1;
                }
                position += 1;
                if position >= total {
                    break;
                }
            }
            if position >= total || id_to_index.insert(*short, position).is_some() {
                // Duplicate or overflowing short IDs: reconstruction
                // is hopeless, fetch the full block.
                self.request_full_block_fallback(peer, hash, now);
                return;
            }
        }

        let mut fill = |tx: &Transaction| {
            let sid = short_id(k0, k1, &tx.wtxid());
            if let Some(&index) = id_to_index.get(&sid) {
                if recovered[index].is_none() {
                    recovered[index] = Some(tx.clone());
                }
            }
        };
        for info in self.mempool.info_all() {
            fill(&info.tx);
        }
        {
            let extra = self.extra_txn.lock().expect("extra txn lock");
            for (_, tx) in extra.iter() {
                fill(tx);
            }
        }
        drop(fill);

        let missing: Vec<u32> = recovered
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();

        if missing.is_empty() {
            let transactions: Vec<Transaction> =
                recovered.into_iter().map(|t| t.expect("filled")).collect();
            let block = Block {
                header,
                transactions,
            };
            self.process_incoming_block(peer, block, true, now);
            return;
        }

        // Ask for what we could not recover.
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            downloader.mark_block_in_flight(peer.id, hash, now);
        }
        self.pending_compacts.lock().expect("pending compacts lock").insert(
            hash,
            PendingCompact {
                peer: peer.id,
                compact,
                recovered,
            },
        );
        tracing::debug!(
            peer = %peer.id,
            missing = missing.len(),
            "requesting compact block transactions"
        );
        self.push(
            peer.id,
            Message::GetBlockTxn {
                block_hash: hash,
                indexes: missing,
            },
        );
    }

    fn request_full_block_fallback(&self, peer: &Peer, hash: Hash256, now: Duration) {
        {
            let mut downloader = self.downloader.lock().expect("downloader lock");
            downloader.mark_block_in_flight(peer.id, hash, now);
        }
        self.push(
            peer.id,
            Message::GetData(vec![InvItem::new(InvType::WitnessBlock, hash)]),
        );
    }

    pub(crate) fn handle_getblocktxn(&self, peer: &Peer, block_hash: Hash256, indexes: Vec<u32>) {
        let Some(handle) = self.chain.lookup_block_index(&block_hash) else {
            return;
        };
        let info = self.chain.block_info(handle);
        let tip_height = self
            .chain
            .active_tip()
            .map(|tip| self.chain.block_info(tip).height)
            .unwrap_or(0);
        if tip_height.saturating_sub(info.height) > MAX_BLOCKTXN_DEPTH {
            // Deep blocks are cheaper to ship whole.
            if let Some(block) = self.chain.get_block(handle) {
                self.push(peer.id, Message::Block(block));
            }
            return;
        }
        let Some(block) = self.chain.get_block(handle) else {
            return;
        };
        let mut transactions = Vec::with_capacity(indexes.len());
        for index in indexes {
            match block.transactions.get(index as usize) {
                Some(tx) => transactions.push(tx.clone()),
                None => {
                    self.misbehaving(peer, 100, "getblocktxn index out of range");
                    return;
                }
            }
        }
        self.push(
            peer.id,
            Message::BlockTxn {
                block_hash,
                transactions,
            },
        );
    }

    pub(crate) fn handle_blocktxn(
        &self,
        peer: &Peer,
        block_hash: Hash256,
        transactions: Vec<Transaction>,
        now: Duration,
    ) {
        let pending = {
            let mut pendings = self.pending_compacts.lock().expect("pending compacts lock");
            match pendings.get(&block_hash) {
                Some(pending) if pending.peer == peer.id => pendings.remove(&block_hash),
                _ => None,
            }
        };
        let Some(mut pending) = pending else {
            tracing::debug!(peer = %peer.id, "unsolicited blocktxn");
            return;
        };

        let mut supplied = transactions.into_iter();
        for slot in pending.recovered.iter_mut() {
            if slot.is_none() {
                match supplied.next() {
                    Some(tx) => *slot = Some(tx),
                    None => {
                        // Short response: reconstruction failed, fall
                        // back to a full block download.
                        self.request_full_block_fallback(peer, block_hash, now);
                        return;
                    }
                }
            }
        }
        if supplied.next().is_some() {
            self.misbehaving(peer, 20, "excess blocktxn transactions");
            return;
        }

        let block = Block {
            header: pending.compact.header,
            transactions: pending
                .recovered
                .into_iter()
                .map(|t| t.expect("filled"))
                .collect(),
        };
        self.process_incoming_block(peer, block, true, now);
    }

    // ---- compact filter serving (BIP 157) ----

    /// Common validation for compact filter requests. Returns the
    /// stop block's handle and height.
    fn validate_cf_request(
        &self,
        peer: &Peer,
        filter_type: u8,
        start_height: u32,
        stop_hash: &Hash256,
        max_range: u32,
    ) -> Option<(BlockIndexHandle, u32)> {
        if !self.config.serve_compact_filters {
            tracing::debug!(peer = %peer.id, "compact filter request but index disabled");
            self.connman.disconnect(peer.id);
            return None;
        }
        if filter_type != 0 {
            tracing::debug!(peer = %peer.id, filter_type, "unsupported filter type");
            self.connman.disconnect(peer.id);
            return None;
        }
        let Some(stop) = self.chain.lookup_block_index(stop_hash) else {
            tracing::debug!(peer = %peer.id, "cf request for unknown stop hash");
            self.connman.disconnect(peer.id);
            return None;
        };
        if !self.chain.in_active_chain(stop) {
            self.connman.disconnect(peer.id);
            return None;
        }
        let stop_height = self.chain.block_info(stop).height;
        if start_height > stop_height {
            self.connman.disconnect(peer.id);
            return None;
        }
        if stop_height - start_height + 1 > max_range {
            tracing::debug!(
                peer = %peer.id,
                requested = stop_height - start_height + 1,
                max = max_range,
                "cf request range too large"
            );
            self.connman.disconnect(peer.id);
            return None;
        }
        Some((stop, stop_height))
    }

    pub(crate) fn handle_getcfilters(
        &self,
        peer: &Peer,
        filter_type: u8,
        start_height: u32,
        stop_hash: Hash256,
    ) {
        let Some(_) = self.validate_cf_request(
            peer,
            filter_type,
            start_height,
            &stop_hash,
            MAX_GETCFILTERS_SIZE,
        ) else {
            return;
        };
        let Some(index) = &self.filter_index else {
            return;
        };
        let Some(filters) = index.lookup_filter_range(start_height, &stop_hash) else {
            tracing::debug!(peer = %peer.id, "filter range not indexed yet");
            return;
        };
        for (block_hash, filter) in filters {
            self.push(
                peer.id,
                Message::CFilter {
                    filter_type,
                    block_hash,
                    filter,
                },
            );
        }
    }

    pub(crate) fn handle_getcfheaders(
        &self,
        peer: &Peer,
        filter_type: u8,
        start_height: u32,
        stop_hash: Hash256,
    ) {
        let Some(_) = self.validate_cf_request(
            peer,
            filter_type,
            start_height,
            &stop_hash,
            MAX_GETCFHEADERS_SIZE,
        ) else {
            return;
        };
        let Some(index) = &self.filter_index else {
            return;
        };

        let prev_filter_header = if start_height > 0 {
            let Some(prev) = self.chain.active_at_height(start_height - 1) else {
                return;
            };
            let prev_hash = self.chain.block_info(prev).hash;
            match index.lookup_filter_header(&prev_hash) {
                Some(header) => header,
                None => return,
            }
        } else {
            ZERO_HASH
        };

        let Some(filter_hashes) = index.lookup_filter_hash_range(start_height, &stop_hash) else {
            return;
        };
        self.push(
            peer.id,
            Message::CFHeaders {
                filter_type,
                stop_hash,
                prev_filter_header,
                filter_hashes,
            },
        );
    }

    pub(crate) fn handle_getcfcheckpt(&self, peer: &Peer, filter_type: u8, stop_hash: Hash256) {
        // Checkpoints span the whole chain; only the stop must check.
        let Some((_, stop_height)) =
            self.validate_cf_request(peer, filter_type, 0, &stop_hash, u32::MAX)
        else {
            return;
        };
        let Some(index) = &self.filter_index else {
            return;
        };

        let mut headers = Vec::new();
        let mut height = CFCHECKPT_INTERVAL;
        while height <= stop_height {
            let Some(handle) = self.chain.active_at_height(height) else {
                break;
            };
            let block_hash = self.chain.block_info(handle).hash;
            match index.lookup_filter_header(&block_hash) {
                Some(header) => headers.push(header),
                None => return,
            }
            height += CFCHECKPT_INTERVAL;
        }
        self.push(
            peer.id,
            Message::CFCheckpt {
                filter_type,
                stop_hash,
                headers,
            },
        );
    }
}
