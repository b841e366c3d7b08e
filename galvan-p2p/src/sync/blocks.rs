//! Block download scheduling.
//!
//! For every peer that can serve blocks we keep a downward-rooted
//! window of up to [`BLOCK_DOWNLOAD_WINDOW`] blocks past the last
//! block we share with it, and fill each peer's transit slots in
//! forward height order. A block is in flight from at most one peer;
//! re-requesting through a different peer moves ownership.

use std::collections::HashMap;
use std::time::Duration;

use galvan_chain::{BlockIndexHandle, ChainManager};
use galvan_core::Hash256;

use crate::config::{
    BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER, BLOCK_DOWNLOAD_WINDOW,
};
use crate::peer::PeerId;

/// A block currently being downloaded.
#[derive(Debug, Clone, Copy)]
pub struct InflightBlock {
    pub peer: PeerId,
    pub started_at: Duration,
}

/// Per-peer download view.
#[derive(Debug, Default)]
pub struct PeerDownloadState {
    /// Best header we know this peer has announced.
    pub best_known_block: Option<BlockIndexHandle>,
    /// Last announced hash we could not resolve yet.
    pub last_unknown_block: Option<Hash256>,
    /// Deepest block both we and the peer have.
    pub last_common_block: Option<BlockIndexHandle>,
    /// Hashes in flight from this peer.
    pub in_flight: Vec<Hash256>,
    /// Set while this peer is the one stalling the window.
    pub stalling_since: Option<Duration>,
    /// Outbound or otherwise favored for initial sync.
    pub preferred_download: bool,
}

/// Scheduler state for all peers' block downloads.
#[derive(Debug, Default)]
pub struct BlockDownloader {
    inflight: HashMap<Hash256, InflightBlock>,
    peers: HashMap<PeerId, PeerDownloadState>,
}

/// Result of a window walk.
#[derive(Debug, Default)]
pub struct NextBlocks {
    pub to_fetch: Vec<BlockIndexHandle>,
    /// Peer holding the window closed, if the walk found nothing
    /// because every missing block is in flight elsewhere.
    pub staller: Option<PeerId>,
}

impl BlockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new peer.
    pub fn register_peer(&mut self, peer: PeerId, preferred_download: bool) {
        self.peers.insert(
            peer,
            PeerDownloadState {
                preferred_download,
                ..Default::default()
            },
        );
    }

    /// Drop a peer, releasing its in-flight blocks. Returns the
    /// freed hashes so callers can reschedule them.
    pub fn remove_peer(&mut self, peer: PeerId) -> Vec<Hash256> {
        let state = self.peers.remove(&peer);
        let freed = state.map(|s| s.in_flight).unwrap_or_default();
        for hash in &freed {
            self.inflight.remove(hash);
        }
        freed
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerDownloadState> {
        self.peers.get(&peer)
    }

    pub fn peer_mut(&mut self, peer: PeerId) -> Option<&mut PeerDownloadState> {
        self.peers.get_mut(&peer)
    }

    /// Number of blocks in flight from a peer.
    pub fn in_flight_count(&self, peer: PeerId) -> usize {
        self.peers
            .get(&peer)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    /// Total blocks in flight.
    pub fn total_in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Which peer (if any) a block is in flight from.
    pub fn in_flight_from(&self, hash: &Hash256) -> Option<PeerId> {
        self.inflight.get(hash).map(|b| b.peer)
    }

    /// Record a block announcement for availability tracking.
    pub fn update_block_availability(
        &mut self,
        peer: PeerId,
        hash: Hash256,
        chain: &dyn ChainManager,
    ) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };

        // Resolve a previously unknown announcement first.
        if let Some(unknown) = state.last_unknown_block {
            if let Some(handle) = chain.lookup_block_index(&unknown) {
                if Self::improves(chain, state.best_known_block, handle) {
                    state.best_known_block = Some(handle);
                }
                state.last_unknown_block = None;
            }
        }

        match chain.lookup_block_index(&hash) {
            Some(handle) => {
                if Self::improves(chain, state.best_known_block, handle) {
                    state.best_known_block = Some(handle);
                }
            }
            None => state.last_unknown_block = Some(hash),
        }
    }

    fn improves(
        chain: &dyn ChainManager,
        current: Option<BlockIndexHandle>,
        candidate: BlockIndexHandle,
    ) -> bool {
        match current {
            None => true,
            Some(current) => {
                chain.block_info(candidate).chainwork >= chain.block_info(current).chainwork
            }
        }
    }

    /// Mark a block in flight from `peer`. Re-marking for the same
    /// peer is a no-op returning false; a different peer takes over
    /// ownership.
    pub fn mark_block_in_flight(&mut self, peer: PeerId, hash: Hash256, now: Duration) -> bool {
        if let Some(existing) = self.inflight.get(&hash) {
            if existing.peer == peer {
                return false;
            }
            let old_peer = existing.peer;
            if let Some(old_state) = self.peers.get_mut(&old_peer) {
                old_state.in_flight.retain(|h| h != &hash);
            }
        }
        self.inflight.insert(
            hash,
            InflightBlock {
                peer,
                started_at: now,
            },
        );
        if let Some(state) = self.peers.get_mut(&peer) {
            if !state.in_flight.contains(&hash) {
                state.in_flight.push(hash);
            }
        }
        true
    }

    /// Clear a completed (or abandoned) download.
    pub fn mark_block_received(&mut self, hash: &Hash256) -> Option<PeerId> {
        let inflight = self.inflight.remove(hash)?;
        if let Some(state) = self.peers.get_mut(&inflight.peer) {
            state.in_flight.retain(|h| h != hash);
        }
        Some(inflight.peer)
    }

    /// Walk the download window and pick the next blocks to request
    /// from `peer`, at most `count`.
    pub fn find_next_blocks_to_download(
        &mut self,
        peer: PeerId,
        chain: &dyn ChainManager,
        count: usize,
    ) -> NextBlocks {
        let mut result = NextBlocks::default();
        if count == 0 {
            return result;
        }
        let Some(state) = self.peers.get_mut(&peer) else {
            return result;
        };

        // Resolve pending unknown announcements.
        if let Some(unknown) = state.last_unknown_block {
            if let Some(handle) = chain.lookup_block_index(&unknown) {
                let better = match state.best_known_block {
                    None => true,
                    Some(cur) => {
                        chain.block_info(handle).chainwork >= chain.block_info(cur).chainwork
                    }
                };
                if better {
                    state.best_known_block = Some(handle);
                }
                state.last_unknown_block = None;
            }
        }

        let Some(best) = state.best_known_block else {
            return result;
        };
        let best_info = chain.block_info(best);
        let Some(tip) = chain.active_tip() else {
            return result;
        };
        let tip_work = chain.block_info(tip).chainwork;
        let threshold = tip_work.max(chain.minimum_chain_work());
        if best_info.chainwork < threshold {
            // This peer has nothing interesting.
            return result;
        }

        let last_common = match state.last_common_block {
            Some(lc) => chain.last_common_ancestor(lc, best),
            None => chain.last_common_ancestor(tip, best),
        };
        state.last_common_block = Some(last_common);
        if last_common == best {
            return result;
        }

        let start_height = chain.block_info(last_common).height;
        let window_end = start_height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = best_info.height.min(window_end);
        let mut advancing = true;
        let mut first_blocked_by: Option<PeerId> = None;

        for height in (start_height + 1)..=max_height {
            let Some(handle) = chain.ancestor(best, height) else {
                break;
            };
            let info = chain.block_info(handle);
            if info.failed {
                break;
            }
            if info.have_data {
                if advancing {
                    state.last_common_block = Some(handle);
                }
                continue;
            }
            advancing = false;
            if let Some(owner) = self.inflight.get(&info.hash).map(|b| b.peer) {
                if owner != peer && first_blocked_by.is_none() {
                    first_blocked_by = Some(owner);
                }
                continue;
            }
            result.to_fetch.push(handle);
            if result.to_fetch.len() == count {
                return result;
            }
        }

        // Nothing to fetch because another peer owns every missing
        // block: that peer is holding the window closed.
        if result.to_fetch.is_empty() {
            result.staller = first_blocked_by;
        }
        result
    }

    /// Blocks whose download has exceeded the per-block timeout.
    ///
    /// The allowance grows with the number of competing downloaders:
    /// `spacing * (base + per_peer * other_validated_downloads)`.
    pub fn timed_out_blocks(&self, now: Duration, target_spacing: u64) -> Vec<(PeerId, Hash256)> {
        let downloading_peers = self
            .peers
            .values()
            .filter(|s| !s.in_flight.is_empty())
            .count();
        let mut out = Vec::new();
        for (hash, inflight) in &self.inflight {
            let others = downloading_peers.saturating_sub(1);
            let allowance_secs = target_spacing as f64
                * (BLOCK_DOWNLOAD_TIMEOUT_BASE + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * others as f64);
            let deadline = inflight.started_at + Duration::from_secs_f64(allowance_secs);
            if now > deadline {
                out.push((inflight.peer, *hash));
            }
        }
        out
    }
}
