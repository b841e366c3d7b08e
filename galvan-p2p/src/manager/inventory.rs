//! Inventory flow: `inv`, `getdata`, `notfound`, `tx`, `mempool`.

use std::time::Duration;

use galvan_chain::MempoolAcceptResult;
use galvan_core::{GenTxId, Hash256, Transaction};

use crate::config::{
    GETDATA_TX_INTERVAL, MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_CMPCTBLOCK_DEPTH, MAX_GETDATA_SZ,
    MAX_INV_SZ, MAX_PEER_TX_ANNOUNCEMENTS, MAX_PEER_TX_REQUEST_IN_FLIGHT, NONPREF_PEER_TX_DELAY,
    OVERLOADED_PEER_TX_DELAY, TXID_RELAY_DELAY,
};
use crate::filters::PartialMerkleTree;
use crate::manager::PeerManager;
use crate::peer::{Peer, ServiceFlags};
use crate::protocol::{CompactBlock, InvItem, InvType, Message};

impl PeerManager {
    /// Whether we consider a transaction already known: in the
    /// mempool, recently confirmed, or cached for relay.
    pub(crate) fn already_have_tx(&self, gtxid: &GenTxId) -> bool {
        if self.mempool.exists(gtxid) {
            return true;
        }
        if self
            .recently_confirmed
            .lock()
            .expect("recent lock")
            .contains(gtxid.hash())
        {
            return true;
        }
        gtxid.is_wtxid()
            && self
                .relay_cache
                .lock()
                .expect("relay cache lock")
                .get(gtxid.hash())
                .is_some()
    }

    fn have_wtxid_relay_peer(&self) -> bool {
        self.all_peers()
            .iter()
            .any(|peer| peer.is_fully_connected() && peer.wtxid_relay())
    }

    /// Feed one tx announcement to the request tracker with the
    /// standard scheduling delays.
    pub(crate) fn add_tx_announcement(&self, peer: &Peer, gtxid: GenTxId, now: Duration) {
        let mut txrequest = self.txrequest.lock().expect("txrequest lock");
        if txrequest.count(peer.id) >= MAX_PEER_TX_ANNOUNCEMENTS {
            // A flooding peer's excess announcements vanish silently.
            return;
        }
        let preferred = peer.direction.is_outbound();
        let mut reqtime = now;
        if !preferred {
            reqtime += NONPREF_PEER_TX_DELAY;
        }
        if !gtxid.is_wtxid() && self.have_wtxid_relay_peer() {
            reqtime += TXID_RELAY_DELAY;
        }
        if txrequest.count_in_flight(peer.id) >= MAX_PEER_TX_REQUEST_IN_FLIGHT {
            reqtime += OVERLOADED_PEER_TX_DELAY;
        }
        txrequest.received_inv(peer.id, gtxid, preferred, reqtime);
    }

    pub(crate) fn handle_inv(
        &self,
        peer: &Peer,
        items: Vec<InvItem>,
        now: Duration,
        _wall: i64,
    ) {
        if items.len() > MAX_INV_SZ {
            self.misbehaving(peer, 20, "oversized inv");
            return;
        }

        let ibd = self.chain.is_initial_block_download();
        let wtxid_relay = peer.wtxid_relay();
        let mut unknown_block = false;

        for item in &items {
            if self.interrupted() {
                return;
            }
            if item.inv_type.is_block() {
                *peer
                    .last_block_announcement
                    .lock()
                    .expect("last announcement lock") = Some(now);
                let mut downloader = self.downloader.lock().expect("downloader lock");
                downloader.update_block_availability(peer.id, item.hash, self.chain.as_ref());
                if self.chain.lookup_block_index(&item.hash).is_none() {
                    unknown_block = true;
                }
                continue;
            }

            // Transaction announcement.
            match item.inv_type {
                InvType::WTx if !wtxid_relay => {
                    tracing::debug!(peer = %peer.id, "wtx inv without wtxidrelay");
                    self.connman.disconnect(peer.id);
                    return;
                }
                InvType::Tx | InvType::WitnessTx if wtxid_relay => {
                    tracing::debug!(peer = %peer.id, "txid inv from wtxidrelay peer");
                    self.connman.disconnect(peer.id);
                    return;
                }
                _ => {}
            }
            if !self.config.tx_relay {
                tracing::debug!(peer = %peer.id, "tx inv while not relaying transactions");
                self.connman.disconnect(peer.id);
                return;
            }
            if ibd {
                continue;
            }
            let Some(gtxid) = item.to_gen_txid() else {
                continue;
            };
            {
                let mut guard = peer.tx_relay.lock().expect("tx relay lock");
                if let Some(relay) = guard.as_mut() {
                    relay.known.insert(*gtxid.hash());
                }
            }
            if !self.already_have_tx(&gtxid) {
                self.add_tx_announcement(peer, gtxid, now);
            }
        }

        // An announced block we cannot connect: ask for headers.
        if unknown_block && !ibd {
            let locator = self.tip_locator();
            self.send_getheaders(peer, locator, galvan_core::ZERO_HASH, now);
        }
    }

    pub(crate) fn handle_getdata(&self, peer: &Peer, items: Vec<InvItem>, now: Duration) {
        if items.len() > MAX_GETDATA_SZ {
            self.misbehaving(peer, 20, "oversized getdata");
            return;
        }
        peer.getdata_queue
            .lock()
            .expect("getdata lock")
            .extend(items);
        self.process_getdata_queue(peer, now);
    }

    /// Serve queued getdata items in request order.
    pub(crate) fn process_getdata_queue(&self, peer: &Peer, now: Duration) {
        let mut notfound: Vec<InvItem> = Vec::new();
        loop {
            if self.interrupted() {
                return;
            }
            let item = {
                let mut queue = peer.getdata_queue.lock().expect("getdata lock");
                match queue.pop_front() {
                    Some(item) => item,
                    None => break,
                }
            };
            let served = if item.inv_type.is_tx() {
                self.serve_tx(peer, &item, now)
            } else {
                self.serve_block_item(peer, &item)
            };
            if !served {
                notfound.push(item);
            }
        }
        if !notfound.is_empty() {
            self.push(peer.id, Message::NotFound(notfound));
        }
    }

    fn serve_tx(&self, peer: &Peer, item: &InvItem, now: Duration) -> bool {
        if !peer.relays_txs() {
            return false;
        }
        let Some(gtxid) = item.to_gen_txid() else {
            return false;
        };

        let tx: Option<Transaction> = match self.mempool.info(&gtxid) {
            Some(info) => Some(info.tx),
            None => self
                .relay_cache
                .lock()
                .expect("relay cache lock")
                .get(gtxid.hash())
                .cloned(),
        };
        let Some(tx) = tx else {
            return false;
        };

        let txid = tx.txid();
        let wtxid = tx.wtxid();
        self.mempool.remove_unbroadcast(&txid);
        // Once served, keep it available a while even if it leaves
        // the mempool, so slow requesters are not left hanging.
        self.relay_cache
            .lock()
            .expect("relay cache lock")
            .insert(wtxid, tx.clone(), now);
        {
            let mut guard = peer.tx_relay.lock().expect("tx relay lock");
            if let Some(relay) = guard.as_mut() {
                relay.known.insert(txid);
                relay.known.insert(wtxid);
            }
        }
        self.push(peer.id, Message::Tx(tx));
        true
    }

    fn serve_block_item(&self, peer: &Peer, item: &InvItem) -> bool {
        let Some(handle) = self.chain.lookup_block_index(&item.hash) else {
            return false;
        };
        let info = self.chain.block_info(handle);
        if !info.have_data {
            return false;
        }
        // Pruned-service peers only get recent blocks from us when we
        // advertise limited service.
        let tip_height = self
            .chain
            .active_tip()
            .map(|tip| self.chain.block_info(tip).height)
            .unwrap_or(0);
        let depth = tip_height.saturating_sub(info.height);
        let local = ServiceFlags::from_bits(self.config.local_services);
        if !local.contains(ServiceFlags::NETWORK)
            && depth > crate::config::NODE_NETWORK_LIMITED_MIN_BLOCKS
        {
            tracing::debug!(peer = %peer.id, depth, "not serving historical block");
            return false;
        }
        let Some(block) = self.chain.get_block(handle) else {
            return false;
        };

        match item.inv_type {
            InvType::Block | InvType::WitnessBlock => {
                self.push(peer.id, Message::Block(block));
            }
            InvType::FilteredBlock => {
                let Some(tree) = self.build_merkle_response(peer, &block) else {
                    // No filter loaded: request silently dropped.
                    return true;
                };
                let (tree, matched) = tree;
                self.push(
                    peer.id,
                    Message::MerkleBlock {
                        header: block.header,
                        tree,
                    },
                );
                for index in matched {
                    self.push(
                        peer.id,
                        Message::Tx(block.transactions[index as usize].clone()),
                    );
                }
            }
            InvType::CmpctBlock => {
                if depth <= MAX_CMPCTBLOCK_DEPTH {
                    let compact = {
                        let cached = self.most_recent_block.lock().expect("recent block lock");
                        match cached.as_ref() {
                            Some(recent) if recent.hash == info.hash => recent.compact.clone(),
                            _ => CompactBlock::from_block(&block, rand::random()),
                        }
                    };
                    self.push(peer.id, Message::CmpctBlock(compact));
                } else {
                    self.push(peer.id, Message::Block(block));
                }
            }
            _ => return false,
        }

        // A block request for the getblocks continuation hash
        // triggers the next inv batch announcement.
        let mut announce = peer.block_announce.lock().expect("block announce lock");
        if announce.continuation_block == Some(info.hash) {
            announce.continuation_block = None;
            if let Some(tip) = self.chain.active_tip() {
                let tip_hash = self.chain.block_info(tip).hash;
                announce.inv_to_send.push(tip_hash);
            }
        }
        true
    }

    fn build_merkle_response(
        &self,
        peer: &Peer,
        block: &galvan_core::Block,
    ) -> Option<(PartialMerkleTree, Vec<u32>)> {
        let guard = peer.tx_relay.lock().expect("tx relay lock");
        let relay = guard.as_ref()?;
        let bloom = relay.bloom.as_ref()?;

        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        let matched_flags: Vec<bool> = block
            .transactions
            .iter()
            .zip(&txids)
            .map(|(tx, txid)| bloom.is_relevant(tx, txid))
            .collect();
        let tree = PartialMerkleTree::from_txids(&txids, &matched_flags);
        let matched: Vec<u32> = matched_flags
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| i as u32)
            .collect();
        Some((tree, matched))
    }

    pub(crate) fn handle_notfound(&self, peer: &Peer, items: Vec<InvItem>, now: Duration) {
        if items.len() > MAX_PEER_TX_ANNOUNCEMENTS + MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return;
        }
        let mut txrequest = self.txrequest.lock().expect("txrequest lock");
        for item in items {
            if item.inv_type.is_tx() {
                txrequest.received_response(peer.id, &item.hash, now);
            }
        }
    }

    pub(crate) fn handle_tx(&self, peer: &Peer, tx: Transaction, now: Duration, _wall: i64) {
        if !self.config.tx_relay {
            tracing::debug!(peer = %peer.id, "unsolicited tx while not relaying");
            self.connman.disconnect(peer.id);
            return;
        }
        let txid = tx.txid();
        let wtxid = tx.wtxid();
        {
            let mut guard = peer.tx_relay.lock().expect("tx relay lock");
            if let Some(relay) = guard.as_mut() {
                relay.known.insert(txid);
                relay.known.insert(wtxid);
            }
        }
        {
            let mut txrequest = self.txrequest.lock().expect("txrequest lock");
            txrequest.received_response(peer.id, &txid, now);
            txrequest.received_response(peer.id, &wtxid, now);
        }

        if self.already_have_tx(&GenTxId::Wtxid(wtxid)) {
            return;
        }

        match self.chain.process_transaction(&tx) {
            MempoolAcceptResult::Accepted { txid, wtxid } => {
                tracing::debug!(peer = %peer.id, "accepted transaction");
                *peer.last_tx_time.lock().expect("last tx lock") = Some(now);
                self.txrequest
                    .lock()
                    .expect("txrequest lock")
                    .forget_tx_hash(&txid);
                self.relay_transaction(txid, wtxid);
            }
            MempoolAcceptResult::Rejected(reason) => {
                use galvan_chain::TxRejectReason::*;
                // Keep rejected parents around: a compact block may
                // still reference them.
                self.extra_txn
                    .lock()
                    .expect("extra txn lock")
                    .push(wtxid, tx);
                if reason == Consensus {
                    self.misbehaving(peer, 100, "consensus-invalid transaction");
                }
            }
        }
    }

    pub(crate) fn handle_mempool_request(&self, peer: &Peer) {
        let local = ServiceFlags::from_bits(self.config.local_services);
        if !local.contains(ServiceFlags::BLOOM) {
            tracing::debug!(peer = %peer.id, "mempool request without bloom service");
            self.connman.disconnect(peer.id);
            return;
        }
        let mut guard = peer.tx_relay.lock().expect("tx relay lock");
        if let Some(relay) = guard.as_mut() {
            relay.send_mempool = true;
        }
    }

    /// Issue due transaction requests for this peer.
    pub(crate) fn request_due_txs(&self, peer: &Peer, now: Duration) {
        let mut expired = Vec::new();
        let requestable = {
            let mut txrequest = self.txrequest.lock().expect("txrequest lock");
            txrequest.get_requestable(peer.id, now, &mut expired)
        };
        for (from_peer, gtxid) in &expired {
            tracing::debug!(peer = %from_peer, gtxid = ?gtxid, "tx request expired");
        }

        if requestable.is_empty() {
            return;
        }
        let mut items = Vec::new();
        {
            let mut txrequest = self.txrequest.lock().expect("txrequest lock");
            for gtxid in requestable {
                if self.already_have_tx(&gtxid) {
                    txrequest.forget_tx_hash(gtxid.hash());
                    continue;
                }
                txrequest.requested_tx(peer.id, &gtxid, now + GETDATA_TX_INTERVAL);
                let inv_type = if gtxid.is_wtxid() {
                    InvType::WTx
                } else {
                    InvType::Tx
                };
                items.push(InvItem::new(inv_type, *gtxid.hash()));
            }
        }
        if !items.is_empty() {
            self.push(peer.id, Message::GetData(items));
        }
    }
}
