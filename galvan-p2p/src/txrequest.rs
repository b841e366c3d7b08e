//! Transaction request tracking.
//!
//! Many peers announce the same transaction; we ask one at a time and
//! fall through to the next on failure or timeout. Announcements move
//! through a small state machine:
//!
//! ```text
//! CandidateDelayed ──(reqtime reached)──► CandidateReady
//! CandidateReady  ──(selected)──► Requested
//! Requested ──(response / expiry)──► removed, siblings reconsidered
//! ```
//!
//! Selection among ready candidates picks the earliest request time,
//! with a keyed-SipHash tiebreak so the choice is unpredictable to
//! peers but stable for us. When a request fails, surviving
//! non-preferred candidates are pushed back by the non-preferred
//! delay before they become eligible.

use std::collections::HashMap;
use std::time::Duration;

use galvan_core::crypto::siphash::SipHasher24;
use galvan_core::{GenTxId, Hash256};

use crate::config::NONPREF_PEER_TX_DELAY;
use crate::peer::PeerId;

/// Announcement lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnnState {
    CandidateDelayed,
    CandidateReady,
    Requested,
}

/// One (peer, gtxid) announcement.
#[derive(Debug, Clone)]
struct Announcement {
    peer: PeerId,
    preferred: bool,
    /// Earliest time the announcement may be requested.
    reqtime: Duration,
    /// Expiry of the outstanding request (Requested only).
    expiry: Duration,
    state: AnnState,
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerCounts {
    total: usize,
    requested: usize,
}

/// Tracker of transaction announcements across all peers.
pub struct TxRequestTracker {
    k0: u64,
    k1: u64,
    by_hash: HashMap<GenTxId, Vec<Announcement>>,
    counts: HashMap<PeerId, PeerCounts>,
}

impl TxRequestTracker {
    /// Create a tracker with the given tiebreak key.
    pub fn new(k0: u64, k1: u64) -> Self {
        Self {
            k0,
            k1,
            by_hash: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    /// Deterministic per-announcement priority; preferred peers beat
    /// non-preferred, then keyed SipHash decides.
    fn priority(k0: u64, k1: u64, peer: PeerId, gtxid: &GenTxId, preferred: bool) -> u64 {
        let mut hasher = SipHasher24::new(k0, k1);
        hasher.write_u64(peer.0);
        hasher.write(gtxid.hash());
        let hash = hasher.finalize() >> 1;
        if preferred {
            hash | (1 << 63)
        } else {
            hash
        }
    }

    /// Record an announcement. No-op if this peer already announced
    /// this gtxid. The caller enforces the per-peer announcement cap.
    pub fn received_inv(
        &mut self,
        peer: PeerId,
        gtxid: GenTxId,
        preferred: bool,
        reqtime: Duration,
    ) {
        let anns = self.by_hash.entry(gtxid).or_default();
        if anns.iter().any(|ann| ann.peer == peer) {
            return;
        }
        anns.push(Announcement {
            peer,
            preferred,
            reqtime,
            expiry: Duration::ZERO,
            state: AnnState::CandidateDelayed,
        });
        self.counts.entry(peer).or_default().total += 1;
    }

    /// Announcements tracked for a peer.
    pub fn count(&self, peer: PeerId) -> usize {
        self.counts.get(&peer).map(|c| c.total).unwrap_or(0)
    }

    /// Outstanding requests assigned to a peer.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.counts.get(&peer).map(|c| c.requested).unwrap_or(0)
    }

    /// Total announcements across all peers.
    pub fn size(&self) -> usize {
        self.counts.values().map(|c| c.total).sum()
    }

    fn drop_announcement(counts: &mut HashMap<PeerId, PeerCounts>, ann: &Announcement) {
        if let Some(count) = counts.get_mut(&ann.peer) {
            count.total = count.total.saturating_sub(1);
            if ann.state == AnnState::Requested {
                count.requested = count.requested.saturating_sub(1);
            }
            if count.total == 0 {
                counts.remove(&ann.peer);
            }
        }
    }

    /// Push surviving candidates back after a failed request, so a
    /// non-preferred fallback peer is asked only after its delay.
    fn reconsider_siblings(anns: &mut [Announcement], now: Duration) {
        for ann in anns.iter_mut() {
            if ann.state != AnnState::Requested && !ann.preferred {
                let delayed_until = now + NONPREF_PEER_TX_DELAY;
                if ann.reqtime < delayed_until {
                    ann.reqtime = delayed_until;
                    ann.state = AnnState::CandidateDelayed;
                }
            }
        }
    }

    /// Collect the gtxids this peer should be asked for now.
    ///
    /// Expired requests are reported through `expired` and their
    /// fall-back candidates re-timed first.
    pub fn get_requestable(
        &mut self,
        peer: PeerId,
        now: Duration,
        expired: &mut Vec<(PeerId, GenTxId)>,
    ) -> Vec<GenTxId> {
        // Expire overdue requests.
        let mut emptied = Vec::new();
        for (gtxid, anns) in self.by_hash.iter_mut() {
            let had_expired = anns
                .iter()
                .position(|ann| ann.state == AnnState::Requested && ann.expiry <= now);
            if let Some(index) = had_expired {
                let ann = anns.remove(index);
                expired.push((ann.peer, *gtxid));
                Self::drop_announcement(&mut self.counts, &ann);
                Self::reconsider_siblings(anns, now);
            }
            if anns.is_empty() {
                emptied.push(*gtxid);
            }
        }
        for gtxid in emptied {
            self.by_hash.remove(&gtxid);
        }

        // Promote and select.
        let (k0, k1) = (self.k0, self.k1);
        let mut selected: Vec<(Duration, u64, GenTxId)> = Vec::new();
        for (gtxid, anns) in self.by_hash.iter_mut() {
            if anns.iter().any(|ann| ann.state == AnnState::Requested) {
                continue;
            }
            let mut best: Option<(Duration, u64, PeerId)> = None;
            for ann in anns.iter_mut() {
                if ann.state == AnnState::CandidateDelayed && ann.reqtime <= now {
                    ann.state = AnnState::CandidateReady;
                }
                if ann.state != AnnState::CandidateReady {
                    continue;
                }
                let priority = Self::priority(k0, k1, ann.peer, gtxid, ann.preferred);
                let candidate = (ann.reqtime, priority, ann.peer);
                best = Some(match best {
                    None => candidate,
                    Some(current) => {
                        // Earliest reqtime wins; priority breaks ties.
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
            if let Some((reqtime, priority, best_peer)) = best {
                if best_peer == peer {
                    selected.push((reqtime, priority, *gtxid));
                }
            }
        }

        selected.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        selected.into_iter().map(|(_, _, gtxid)| gtxid).collect()
    }

    /// Mark a candidate as requested from `peer`.
    pub fn requested_tx(&mut self, peer: PeerId, gtxid: &GenTxId, expiry: Duration) {
        if let Some(anns) = self.by_hash.get_mut(gtxid) {
            for ann in anns.iter_mut() {
                if ann.peer == peer && ann.state != AnnState::Requested {
                    ann.state = AnnState::Requested;
                    ann.expiry = expiry;
                    if let Some(count) = self.counts.get_mut(&peer) {
                        count.requested += 1;
                    }
                    return;
                }
            }
        }
    }

    /// A peer answered (tx delivered or notfound) for this hash.
    ///
    /// Removes that peer's announcements for both the txid and wtxid
    /// interpretations of the hash.
    pub fn received_response(&mut self, peer: PeerId, hash: &Hash256, now: Duration) {
        for gtxid in [GenTxId::Txid(*hash), GenTxId::Wtxid(*hash)] {
            if let Some(anns) = self.by_hash.get_mut(&gtxid) {
                if let Some(index) = anns.iter().position(|ann| ann.peer == peer) {
                    let ann = anns.remove(index);
                    let was_requested = ann.state == AnnState::Requested;
                    Self::drop_announcement(&mut self.counts, &ann);
                    if was_requested {
                        Self::reconsider_siblings(anns, now);
                    }
                }
                if anns.is_empty() {
                    self.by_hash.remove(&gtxid);
                }
            }
        }
    }

    /// Forget a transaction entirely (confirmed or accepted).
    pub fn forget_tx_hash(&mut self, hash: &Hash256) {
        for gtxid in [GenTxId::Txid(*hash), GenTxId::Wtxid(*hash)] {
            if let Some(anns) = self.by_hash.remove(&gtxid) {
                for ann in &anns {
                    Self::drop_announcement(&mut self.counts, ann);
                }
            }
        }
    }

    /// Drop everything announced by a disconnecting peer.
    pub fn disconnected_peer(&mut self, peer: PeerId) {
        let mut emptied = Vec::new();
        for (gtxid, anns) in self.by_hash.iter_mut() {
            if let Some(index) = anns.iter().position(|ann| ann.peer == peer) {
                let ann = anns.remove(index);
                Self::drop_announcement(&mut self.counts, &ann);
            }
            if anns.is_empty() {
                emptied.push(*gtxid);
            }
        }
        for gtxid in emptied {
            self.by_hash.remove(&gtxid);
        }
    }
}

impl std::fmt::Debug for TxRequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxRequestTracker")
            .field("hashes", &self.by_hash.len())
            .field("announcements", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: Hash256 = [7u8; 32];

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn tracker() -> TxRequestTracker {
        TxRequestTracker::new(0x1234, 0x5678)
    }

    #[test]
    fn test_single_peer_flow() {
        let mut tracker = tracker();
        let peer = PeerId::new(1);
        let gtxid = GenTxId::Txid(HASH);

        tracker.received_inv(peer, gtxid, true, secs(0));
        assert_eq!(tracker.count(peer), 1);
        assert_eq!(tracker.size(), 1);

        let mut expired = Vec::new();
        let requestable = tracker.get_requestable(peer, secs(0), &mut expired);
        assert_eq!(requestable, vec![gtxid]);
        assert!(expired.is_empty());

        tracker.requested_tx(peer, &gtxid, secs(60));
        assert_eq!(tracker.count_in_flight(peer), 1);

        // While requested, nothing further is requestable.
        assert!(tracker
            .get_requestable(peer, secs(1), &mut expired)
            .is_empty());

        tracker.received_response(peer, &HASH, secs(2));
        assert_eq!(tracker.size(), 0);
        assert_eq!(tracker.count_in_flight(peer), 0);
    }

    #[test]
    fn test_delayed_candidate_waits() {
        let mut tracker = tracker();
        let peer = PeerId::new(1);
        let gtxid = GenTxId::Wtxid(HASH);

        tracker.received_inv(peer, gtxid, false, secs(2));
        let mut expired = Vec::new();
        assert!(tracker
            .get_requestable(peer, secs(1), &mut expired)
            .is_empty());
        assert_eq!(
            tracker.get_requestable(peer, secs(2), &mut expired),
            vec![gtxid]
        );
    }

    #[test]
    fn test_preferred_peer_selected_first() {
        let mut tracker = tracker();
        let preferred = PeerId::new(1);
        let other = PeerId::new(2);
        let gtxid = GenTxId::Txid(HASH);

        // Same reqtime; the preferred peer must win the tiebreak.
        tracker.received_inv(other, gtxid, false, secs(0));
        tracker.received_inv(preferred, gtxid, true, secs(0));

        let mut expired = Vec::new();
        assert!(tracker
            .get_requestable(other, secs(0), &mut expired)
            .is_empty());
        assert_eq!(
            tracker.get_requestable(preferred, secs(0), &mut expired),
            vec![gtxid]
        );
    }

    #[test]
    fn test_fallthrough_after_notfound() {
        let mut tracker = tracker();
        let a = PeerId::new(1);
        let b = PeerId::new(2);
        let gtxid = GenTxId::Txid(HASH);

        tracker.received_inv(a, gtxid, true, secs(0));
        tracker.received_inv(b, gtxid, false, secs(3));

        let mut expired = Vec::new();
        assert_eq!(tracker.get_requestable(a, secs(0), &mut expired), vec![gtxid]);
        tracker.requested_tx(a, &gtxid, secs(60));

        // Peer A fails at t=30; B is re-delayed by the non-preferred
        // delay and becomes requestable at t=32.
        tracker.received_response(a, &HASH, secs(30));
        assert!(tracker
            .get_requestable(b, secs(31), &mut expired)
            .is_empty());
        assert_eq!(
            tracker.get_requestable(b, secs(32), &mut expired),
            vec![gtxid]
        );
    }

    #[test]
    fn test_expiry_reports_and_falls_through() {
        let mut tracker = tracker();
        let a = PeerId::new(1);
        let b = PeerId::new(2);
        let gtxid = GenTxId::Txid(HASH);

        tracker.received_inv(a, gtxid, true, secs(0));
        tracker.received_inv(b, gtxid, true, secs(0));

        let mut expired = Vec::new();
        let first = tracker.get_requestable(a, secs(0), &mut expired);
        if first.is_empty() {
            // Tiebreak selected B; request from B instead.
            let other = tracker.get_requestable(b, secs(0), &mut expired);
            assert_eq!(other, vec![gtxid]);
            tracker.requested_tx(b, &gtxid, secs(60));
            let after = tracker.get_requestable(a, secs(61), &mut expired);
            assert_eq!(expired, vec![(b, gtxid)]);
            assert_eq!(after, vec![gtxid]);
        } else {
            tracker.requested_tx(a, &gtxid, secs(60));
            let after = tracker.get_requestable(b, secs(61), &mut expired);
            assert_eq!(expired, vec![(a, gtxid)]);
            assert_eq!(after, vec![gtxid]);
        }
    }

    #[test]
    fn test_each_peer_asked_at_most_once() {
        let mut tracker = tracker();
        let peers: Vec<PeerId> = (1..=4).map(PeerId::new).collect();
        let gtxid = GenTxId::Txid(HASH);
        for peer in &peers {
            tracker.received_inv(*peer, gtxid, true, secs(0));
        }

        let mut asked = Vec::new();
        let mut now = secs(0);
        let mut expired = Vec::new();
        for _ in 0..4 {
            let selected = peers
                .iter()
                .find(|p| !tracker.get_requestable(**p, now, &mut expired).is_empty())
                .copied()
                .expect("one peer requestable");
            assert!(!asked.contains(&selected), "peer asked twice");
            asked.push(selected);
            tracker.requested_tx(selected, &gtxid, now + secs(60));
            tracker.received_response(selected, &HASH, now + secs(1));
            now += secs(10);
        }
        assert_eq!(tracker.size(), 0);
    }

    #[test]
    fn test_disconnected_peer_cleans_up() {
        let mut tracker = tracker();
        let a = PeerId::new(1);
        let b = PeerId::new(2);
        tracker.received_inv(a, GenTxId::Txid(HASH), true, secs(0));
        tracker.received_inv(b, GenTxId::Txid(HASH), true, secs(0));
        tracker.received_inv(a, GenTxId::Wtxid([8u8; 32]), true, secs(0));

        tracker.disconnected_peer(a);
        assert_eq!(tracker.count(a), 0);
        assert_eq!(tracker.count(b), 1);
        assert_eq!(tracker.size(), 1);
    }

    #[test]
    fn test_forget_tx_hash_drops_both_forms() {
        let mut tracker = tracker();
        let a = PeerId::new(1);
        tracker.received_inv(a, GenTxId::Txid(HASH), true, secs(0));
        tracker.received_inv(PeerId::new(2), GenTxId::Wtxid(HASH), true, secs(0));

        tracker.forget_tx_hash(&HASH);
        assert_eq!(tracker.size(), 0);
    }

    #[test]
    fn test_duplicate_inv_ignored() {
        let mut tracker = tracker();
        let a = PeerId::new(1);
        tracker.received_inv(a, GenTxId::Txid(HASH), true, secs(0));
        tracker.received_inv(a, GenTxId::Txid(HASH), false, secs(5));
        assert_eq!(tracker.count(a), 1);
    }
}
