//! Anti-DoS two-phase headers synchronization.
//!
//! Accepting headers into the block index costs memory, so a peer
//! must first prove its chain carries enough work. PRESYNC receives
//! the whole headers chain without storing it, checking continuity
//! and per-header PoW while accumulating claimed work and folding a
//! running commitment hash. Once the claimed work passes the
//! threshold, REDOWNLOAD fetches the same range again; the second
//! pass must fold to the same commitment, so the peer cannot swap in
//! a different chain, and only then are headers handed to the caller
//! for storage.

use std::time::Duration;

use galvan_chain::{BlockLocator, Work};
use galvan_core::crypto::hashing::sha256d_pair;
use galvan_core::{BlockHeader, Hash256, ZERO_HASH};

use crate::config::{HEADERS_DOWNLOAD_TIMEOUT_BASE, HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER};
use crate::peer::PeerId;

/// Phase of the synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersSyncPhase {
    /// Accumulating claimed work without storing headers.
    Presync,
    /// Re-downloading against the recorded commitment.
    Redownload,
    /// Finished, successfully or not.
    Final,
}

/// Outcome of processing one headers message.
#[derive(Debug, Default)]
pub struct HeadersProcessResult {
    /// False when the peer violated the protocol (punishable).
    pub success: bool,
    /// Whether a follow-up `getheaders` should be sent.
    pub request_more: bool,
    /// Headers cleared for storage (redownload completion only).
    pub pow_validated_headers: Vec<BlockHeader>,
}

/// State of one peer's anti-DoS headers sync.
#[derive(Debug)]
pub struct HeadersSyncState {
    peer: PeerId,
    phase: HeadersSyncPhase,

    /// Anchor: our known header the peer's chain builds on.
    chain_start_hash: Hash256,
    chain_start_height: u32,

    /// Threshold of total claimed work.
    minimum_required_work: Work,

    // Presync progress.
    presync_last_hash: Hash256,
    presync_height: u32,
    presync_work: Work,
    presync_last_time: u32,
    presync_chain_commitment: Hash256,

    // Commitment recorded at the presync-to-redownload transition.
    commitment: Option<Hash256>,
    commitment_height: u32,

    // Redownload progress.
    redownload_last_hash: Hash256,
    redownload_height: u32,
    redownload_chain_commitment: Hash256,
    redownload_buffer: Vec<BlockHeader>,
}

impl HeadersSyncState {
    /// Start a sync anchored at a known header.
    pub fn new(
        peer: PeerId,
        chain_start_hash: Hash256,
        chain_start_height: u32,
        chain_start_work: Work,
        minimum_required_work: Work,
    ) -> Self {
        Self {
            peer,
            phase: HeadersSyncPhase::Presync,
            chain_start_hash,
            chain_start_height,
            minimum_required_work,
            presync_last_hash: chain_start_hash,
            presync_height: chain_start_height,
            presync_work: chain_start_work,
            presync_last_time: 0,
            presync_chain_commitment: ZERO_HASH,
            commitment: None,
            commitment_height: 0,
            redownload_last_hash: chain_start_hash,
            redownload_height: chain_start_height,
            redownload_chain_commitment: ZERO_HASH,
            redownload_buffer: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn phase(&self) -> HeadersSyncPhase {
        self.phase
    }

    pub fn is_final(&self) -> bool {
        self.phase == HeadersSyncPhase::Final
    }

    /// Claimed work accumulated during presync.
    pub fn presync_work(&self) -> Work {
        self.presync_work
    }

    /// Height reached during presync.
    pub fn presync_height(&self) -> u32 {
        self.presync_height
    }

    /// Timestamp of the last presync header.
    pub fn presync_time(&self) -> u32 {
        self.presync_last_time
    }

    /// Overall deadline for a sync expected to deliver `count` headers.
    pub fn timeout_for(expected_count: u64) -> Duration {
        HEADERS_DOWNLOAD_TIMEOUT_BASE + HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER * expected_count as u32
    }

    /// Locator for the next `getheaders` of the current phase.
    pub fn next_headers_request_locator(&self) -> BlockLocator {
        let last = match self.phase {
            HeadersSyncPhase::Presync => self.presync_last_hash,
            HeadersSyncPhase::Redownload => self.redownload_last_hash,
            HeadersSyncPhase::Final => self.chain_start_hash,
        };
        let mut hashes = vec![last];
        if last != self.chain_start_hash {
            hashes.push(self.chain_start_hash);
        }
        BlockLocator { hashes }
    }

    /// Consume one headers message. `full_batch` is true when the
    /// message reached the protocol's 2000-header limit, implying the
    /// peer has more.
    pub fn process_next_headers(
        &mut self,
        headers: &[BlockHeader],
        full_batch: bool,
    ) -> HeadersProcessResult {
        match self.phase {
            HeadersSyncPhase::Presync => self.process_presync(headers, full_batch),
            HeadersSyncPhase::Redownload => self.process_redownload(headers, full_batch),
            HeadersSyncPhase::Final => HeadersProcessResult {
                success: true,
                ..Default::default()
            },
        }
    }

    fn process_presync(
        &mut self,
        headers: &[BlockHeader],
        full_batch: bool,
    ) -> HeadersProcessResult {
        for header in headers {
            if header.prev_blockhash != self.presync_last_hash || !header.check_pow() {
                self.phase = HeadersSyncPhase::Final;
                return HeadersProcessResult::default();
            }
            let hash = header.hash();
            self.presync_last_hash = hash;
            self.presync_height += 1;
            self.presync_work = self.presync_work + header.work();
            self.presync_last_time = header.time;
            self.presync_chain_commitment =
                sha256d_pair(&hash, &self.presync_chain_commitment);
        }

        if self.presync_work >= self.minimum_required_work {
            // Enough claimed work: remember the commitment and fetch
            // the same range again, this time for keeps.
            self.commitment = Some(self.presync_chain_commitment);
            self.commitment_height = self.presync_height;
            self.phase = HeadersSyncPhase::Redownload;
            tracing::debug!(
                peer = %self.peer,
                height = self.presync_height,
                "headers presync reached work threshold, redownloading"
            );
            return HeadersProcessResult {
                success: true,
                request_more: true,
                pow_validated_headers: Vec::new(),
            };
        }

        if full_batch {
            HeadersProcessResult {
                success: true,
                request_more: true,
                pow_validated_headers: Vec::new(),
            }
        } else {
            // The peer's chain ended below the work threshold.
            tracing::debug!(peer = %self.peer, "headers presync ended below work threshold");
            self.phase = HeadersSyncPhase::Final;
            HeadersProcessResult {
                success: true,
                ..Default::default()
            }
        }
    }

    fn process_redownload(
        &mut self,
        headers: &[BlockHeader],
        full_batch: bool,
    ) -> HeadersProcessResult {
        for header in headers {
            if self.redownload_height >= self.commitment_height {
                // Ignore anything past the committed range.
                break;
            }
            if header.prev_blockhash != self.redownload_last_hash || !header.check_pow() {
                self.phase = HeadersSyncPhase::Final;
                return HeadersProcessResult::default();
            }
            let hash = header.hash();
            self.redownload_last_hash = hash;
            self.redownload_height += 1;
            self.redownload_chain_commitment =
                sha256d_pair(&hash, &self.redownload_chain_commitment);
            self.redownload_buffer.push(*header);
        }

        if self.redownload_height == self.commitment_height {
            self.phase = HeadersSyncPhase::Final;
            if Some(self.redownload_chain_commitment) == self.commitment {
                tracing::debug!(
                    peer = %self.peer,
                    count = self.redownload_buffer.len(),
                    "headers redownload matched commitment"
                );
                return HeadersProcessResult {
                    success: true,
                    request_more: false,
                    pow_validated_headers: std::mem::take(&mut self.redownload_buffer),
                };
            }
            // The peer substituted a different chain.
            tracing::debug!(peer = %self.peer, "headers redownload commitment mismatch");
            return HeadersProcessResult::default();
        }

        if full_batch {
            HeadersProcessResult {
                success: true,
                request_more: true,
                pow_validated_headers: Vec::new(),
            }
        } else {
            // Ran dry before reaching its own committed chain.
            self.phase = HeadersSyncPhase::Final;
            HeadersProcessResult::default()
        }
    }
}
