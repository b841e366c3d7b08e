//! Stochastic address manager.
//!
//! A bounded table of peer addresses designed so no localized
//! attacker can take it over: addresses we have not connected to live
//! in 1024 "new" buckets chosen by the /16 group of whoever told us
//! about them, addresses that worked live in 256 "tried" buckets, and
//! every bucket/position choice is keyed SipHash over a per-instance
//! 256-bit secret. A "new" address may appear in up to eight buckets
//! (with exponentially decreasing probability); a "tried" address
//! occupies exactly one slot. Evicting a tried incumbent requires a
//! staged collision resolved by a later feeler test.

pub mod persistence;

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use galvan_core::crypto::siphash::SipHasher24;

use crate::protocol::NetAddress;

/// Number of "new" buckets.
pub const NEW_BUCKET_COUNT: usize = 1024;

/// Number of "tried" buckets.
pub const TRIED_BUCKET_COUNT: usize = 256;

/// Slots per bucket.
pub const BUCKET_SIZE: usize = 64;

/// Most "new" buckets a single address may occupy.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// Candidate new buckets per source group.
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;

/// Candidate tried buckets per address group.
const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// How old a last-seen time may be before an entry turns stale.
const HORIZON_SECS: i64 = 30 * 24 * 60 * 60;

/// Failed attempts tolerated for never-successful entries.
const RETRIES: u32 = 3;

/// Failures tolerated over the failure window for known-good entries.
const MAX_FAILURES: u32 = 10;

/// The failure window.
const MIN_FAIL_SECS: i64 = 7 * 24 * 60 * 60;

/// Tolerated clock skew into the future.
const MAX_FUTURE_SECS: i64 = 10 * 60;

/// Recency window treating a tried entry as verified.
const TEST_WINDOW_SECS: i64 = 40 * 60;

/// One stored address with quality metadata.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub address: NetAddress,
    pub services: u64,
    /// Group of the peer that told us about this address.
    pub source_group: Vec<u8>,
    /// Last time the address was seen advertised (unix seconds).
    pub last_seen: i64,
    /// Last connection attempt.
    pub last_try: i64,
    /// Last successful connection.
    pub last_success: i64,
    /// Connection attempts since the last success.
    pub attempts: u32,
    /// Number of "new" buckets referencing this entry.
    pub ref_count: u32,
    pub in_tried: bool,
    /// Position in the random-order vector.
    random_pos: usize,
}

impl AddrInfo {
    /// Whether the entry is bad enough to be replaced outright.
    pub fn is_terrible(&self, now: i64) -> bool {
        if self.last_try >= now - 60 {
            // Tried in the last minute: give it the benefit.
            return false;
        }
        if self.last_seen > now + MAX_FUTURE_SECS {
            return true;
        }
        if self.last_seen == 0 || now - self.last_seen > HORIZON_SECS {
            return true;
        }
        if self.last_success == 0 && self.attempts >= RETRIES {
            return true;
        }
        if now - self.last_success > MIN_FAIL_SECS && self.attempts >= MAX_FAILURES {
            return true;
        }
        false
    }

    /// Relative selection chance, decaying with recent failures.
    fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0f64;
        if now - self.last_try < 600 {
            chance *= 0.01;
        }
        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }
}

/// The stochastic new/tried address table.
pub struct AddrMan {
    key: [u8; 32],
    k0: u64,
    k1: u64,
    rng: StdRng,
    slots: Vec<Option<AddrInfo>>,
    free_slots: Vec<usize>,
    by_identity: HashMap<Vec<u8>, usize>,
    new_buckets: Vec<[Option<usize>; BUCKET_SIZE]>,
    tried_buckets: Vec<[Option<usize>; BUCKET_SIZE]>,
    /// All live slot ids in shuffled-sampling order.
    random_order: Vec<usize>,
    new_count: usize,
    tried_count: usize,
    /// Entries staged to enter tried over an occupied slot.
    tried_collisions: HashSet<usize>,
}

impl AddrMan {
    /// Create with a random secret key and OS-seeded randomness.
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::with_key(key, StdRng::from_entropy())
    }

    /// Create with explicit key and RNG (tests want determinism).
    pub fn with_key(key: [u8; 32], rng: StdRng) -> Self {
        let k0 = u64::from_le_bytes(key[0..8].try_into().expect("8 bytes"));
        let k1 = u64::from_le_bytes(key[8..16].try_into().expect("8 bytes"));
        Self {
            key,
            k0,
            k1,
            rng,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_identity: HashMap::new(),
            new_buckets: vec![[None; BUCKET_SIZE]; NEW_BUCKET_COUNT],
            tried_buckets: vec![[None; BUCKET_SIZE]; TRIED_BUCKET_COUNT],
            random_order: Vec::new(),
            new_count: 0,
            tried_count: 0,
            tried_collisions: HashSet::new(),
        }
    }

    /// The instance secret (persisted so bucketing stays stable).
    pub fn secret_key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Unique addresses stored.
    pub fn size(&self) -> usize {
        self.by_identity.len()
    }

    /// Entries in the tried table.
    pub fn tried_count(&self) -> usize {
        self.tried_count
    }

    /// Entries in the new table.
    pub fn new_count(&self) -> usize {
        self.new_count
    }

    fn sip(&self, tag: u8, parts: &[&[u8]]) -> u64 {
        let mut hasher = SipHasher24::new(self.k0, self.k1);
        hasher.write(&[tag]);
        for part in parts {
            hasher.write(part);
        }
        hasher.finalize()
    }

    fn new_bucket(&self, addr: &NetAddress, source_group: &[u8]) -> usize {
        let addr_group = addr.group_key();
        let h1 = self.sip(1, &[source_group, &addr_group]) % NEW_BUCKETS_PER_SOURCE_GROUP;
        (self.sip(2, &[source_group, &h1.to_le_bytes()]) % NEW_BUCKET_COUNT as u64) as usize
    }

    fn tried_bucket(&self, addr: &NetAddress) -> usize {
        let identity = addr.identity_key();
        let group = addr.group_key();
        let h1 = self.sip(3, &[&identity]) % TRIED_BUCKETS_PER_GROUP;
        (self.sip(4, &[&group, &h1.to_le_bytes()]) % TRIED_BUCKET_COUNT as u64) as usize
    }

    fn bucket_position(&self, is_new: bool, bucket: usize, identity: &[u8]) -> usize {
        let tag = if is_new { 5 } else { 6 };
        (self.sip(tag, &[&(bucket as u32).to_le_bytes(), identity]) % BUCKET_SIZE as u64) as usize
    }

    fn entry(&self, id: usize) -> &AddrInfo {
        self.slots[id].as_ref().expect("live slot")
    }

    fn entry_mut(&mut self, id: usize) -> &mut AddrInfo {
        self.slots[id].as_mut().expect("live slot")
    }

    fn create(&mut self, info: AddrInfo) -> usize {
        let identity = info.address.identity_key();
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(info);
                id
            }
            None => {
                self.slots.push(Some(info));
                self.slots.len() - 1
            }
        };
        self.entry_mut(id).random_pos = self.random_order.len();
        self.random_order.push(id);
        self.by_identity.insert(identity, id);
        self.new_count += 1;
        id
    }

    fn delete(&mut self, id: usize) {
        let info = self.slots[id].take().expect("live slot");
        debug_assert_eq!(info.ref_count, 0);
        debug_assert!(!info.in_tried);
        self.by_identity.remove(&info.address.identity_key());
        // Swap-remove from the random order, fixing the moved entry.
        let pos = info.random_pos;
        let last = self.random_order.len() - 1;
        self.random_order.swap(pos, last);
        self.random_order.pop();
        if pos <= last && pos < self.random_order.len() {
            let moved = self.random_order[pos];
            self.entry_mut(moved).random_pos = pos;
        }
        self.free_slots.push(id);
        self.new_count = self.new_count.saturating_sub(1);
        self.tried_collisions.remove(&id);
    }

    /// Insert `id` into the new bucket chosen by its source. Returns
    /// false when the entry could not be placed and was deleted.
    fn insert_into_new_bucket(&mut self, id: usize, now: i64) -> bool {
        let (bucket, pos) = {
            let info = self.entry(id);
            let bucket = self.new_bucket(&info.address, &info.source_group);
            let identity = info.address.identity_key();
            (bucket, self.bucket_position(true, bucket, &identity))
        };

        match self.new_buckets[bucket][pos] {
            Some(existing) if existing == id => true,
            occupant => {
                let evict = match occupant {
                    None => true,
                    Some(other) => {
                        let other_info = self.entry(other);
                        // Replace entries that are bad, or that have
                        // refuge in another bucket while ours has none.
                        other_info.is_terrible(now)
                            || (other_info.ref_count > 1 && self.entry(id).ref_count == 0)
                    }
                };
                if evict {
                    if let Some(other) = occupant {
                        self.new_buckets[bucket][pos] = None;
                        let other_info = self.entry_mut(other);
                        other_info.ref_count = other_info.ref_count.saturating_sub(1);
                        if self.entry(other).ref_count == 0 && !self.entry(other).in_tried {
                            self.delete(other);
                        }
                    }
                    self.new_buckets[bucket][pos] = Some(id);
                    self.entry_mut(id).ref_count += 1;
                    true
                } else if self.entry(id).ref_count == 0 {
                    self.delete(id);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Attempt to add addresses heard from `source`. Returns how many
    /// were newly stored.
    pub fn add(
        &mut self,
        addrs: &[(NetAddress, u64, i64)],
        source: &NetAddress,
        time_penalty: i64,
        now: i64,
    ) -> usize {
        let source_group = source.group_key();
        let mut added = 0;
        for (address, services, seen_time) in addrs {
            if self.add_single(address, *services, &source_group, *seen_time, time_penalty, now) {
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(count = added, source = %source, "stored new addresses");
        }
        added
    }

    fn add_single(
        &mut self,
        address: &NetAddress,
        services: u64,
        source_group: &[u8],
        seen_time: i64,
        time_penalty: i64,
        now: i64,
    ) -> bool {
        if !address.is_routable() {
            return false;
        }
        let identity = address.identity_key();
        let penalized_time = seen_time.saturating_sub(time_penalty);

        if let Some(&id) = self.by_identity.get(&identity) {
            // Periodic time refresh; the update interval grows when
            // the entry is fresh so floods cannot keep it pinned.
            {
                let info = self.entry_mut(id);
                let interval = if info.last_seen < now - 24 * 60 * 60 {
                    60 * 60
                } else {
                    24 * 60 * 60
                };
                if penalized_time > info.last_seen + interval {
                    info.last_seen = penalized_time;
                }
                info.services |= services;

                if info.in_tried || info.ref_count >= NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }
            }
            // Chance of an extra bucket halves with every reference.
            let factor = 1u32 << self.entry(id).ref_count;
            if self.rng.gen_range(0..factor) != 0 {
                return false;
            }
            // The extra bucket is chosen by the newest source.
            self.entry_mut(id).source_group = source_group.to_vec();
            self.insert_into_new_bucket(id, now);
            false
        } else {
            let id = self.create(AddrInfo {
                address: address.clone(),
                services,
                source_group: source_group.to_vec(),
                last_seen: penalized_time.max(0),
                last_try: 0,
                last_success: 0,
                attempts: 0,
                ref_count: 0,
                in_tried: false,
                random_pos: 0,
            });
            self.insert_into_new_bucket(id, now)
        }
    }

    /// Remove all of an entry's new-table references (for a move to
    /// tried). Position depends on the bucket, so every bucket gets
    /// checked.
    fn clear_new_references(&mut self, id: usize) {
        let identity = self.entry(id).address.identity_key();
        for bucket in 0..NEW_BUCKET_COUNT {
            let pos = self.bucket_position(true, bucket, &identity);
            if self.new_buckets[bucket][pos] == Some(id) {
                self.new_buckets[bucket][pos] = None;
                let info = self.entry_mut(id);
                info.ref_count = info.ref_count.saturating_sub(1);
            }
        }
    }

    fn make_tried(&mut self, id: usize) {
        self.clear_new_references(id);
        let (bucket, pos) = {
            let info = self.entry(id);
            let bucket = self.tried_bucket(&info.address);
            let identity = info.address.identity_key();
            (bucket, self.bucket_position(false, bucket, &identity))
        };
        debug_assert!(self.tried_buckets[bucket][pos].is_none());
        self.tried_buckets[bucket][pos] = Some(id);
        let info = self.entry_mut(id);
        info.in_tried = true;
        self.new_count = self.new_count.saturating_sub(1);
        self.tried_count += 1;
    }

    /// Evict a tried entry back to the new table.
    fn move_tried_to_new(&mut self, id: usize, now: i64) {
        let (bucket, pos) = {
            let info = self.entry(id);
            let bucket = self.tried_bucket(&info.address);
            let identity = info.address.identity_key();
            (bucket, self.bucket_position(false, bucket, &identity))
        };
        debug_assert_eq!(self.tried_buckets[bucket][pos], Some(id));
        self.tried_buckets[bucket][pos] = None;
        self.tried_count = self.tried_count.saturating_sub(1);
        self.new_count += 1;
        let info = self.entry_mut(id);
        info.in_tried = false;
        if !self.insert_into_new_bucket(id, now) {
            // No room anywhere in new: gone for good.
            tracing::debug!("evicted tried entry had no new slot");
        }
    }

    /// Mark an address as accessible, moving it toward tried.
    /// Applying it twice behaves like once with the later time.
    pub fn good(&mut self, address: &NetAddress, now: i64) -> bool {
        let Some(&id) = self.by_identity.get(&address.identity_key()) else {
            return false;
        };
        {
            let info = self.entry_mut(id);
            info.last_success = now;
            info.last_try = now;
            info.attempts = 0;
            // last_seen deliberately not updated: gossip decides that.
            if info.in_tried {
                return false;
            }
        }

        let (bucket, pos) = {
            let info = self.entry(id);
            let bucket = self.tried_bucket(&info.address);
            let identity = info.address.identity_key();
            (bucket, self.bucket_position(false, bucket, &identity))
        };
        match self.tried_buckets[bucket][pos] {
            None => {
                self.make_tried(id);
                true
            }
            Some(_) => {
                // Stage the collision for a later feeler resolution.
                self.tried_collisions.insert(id);
                false
            }
        }
    }

    /// Record a connection attempt.
    pub fn attempt(&mut self, address: &NetAddress, count_failure: bool, now: i64) {
        if let Some(&id) = self.by_identity.get(&address.identity_key()) {
            let info = self.entry_mut(id);
            info.last_try = now;
            if count_failure {
                info.attempts += 1;
            }
        }
    }

    /// Record that we were connected to this address until `now`.
    pub fn connected(&mut self, address: &NetAddress, now: i64) {
        if let Some(&id) = self.by_identity.get(&address.identity_key()) {
            let info = self.entry_mut(id);
            if now - info.last_seen > 20 * 60 {
                info.last_seen = now;
            }
        }
    }

    /// Update an entry's service bits.
    pub fn set_services(&mut self, address: &NetAddress, services: u64) {
        if let Some(&id) = self.by_identity.get(&address.identity_key()) {
            self.entry_mut(id).services = services;
        }
    }

    /// Resolve staged tried-table collisions: complete the swap when
    /// the incumbent recently failed, keep the incumbent when it
    /// recently worked, leave the rest for feeler tests.
    pub fn resolve_collisions(&mut self, now: i64) {
        let staged: Vec<usize> = self.tried_collisions.iter().copied().collect();
        for id in staged {
            let Some(info) = self.slots.get(id).and_then(|s| s.as_ref()) else {
                self.tried_collisions.remove(&id);
                continue;
            };
            if info.in_tried {
                self.tried_collisions.remove(&id);
                continue;
            }
            let (bucket, pos) = {
                let bucket = self.tried_bucket(&info.address);
                let identity = info.address.identity_key();
                (bucket, self.bucket_position(false, bucket, &identity))
            };
            match self.tried_buckets[bucket][pos] {
                None => {
                    self.make_tried(id);
                    self.tried_collisions.remove(&id);
                }
                Some(incumbent) => {
                    let incumbent_info = self.entry(incumbent);
                    if incumbent_info.last_success >= now - TEST_WINDOW_SECS {
                        // Incumbent proved itself recently; keep it.
                        self.tried_collisions.remove(&id);
                    } else if incumbent_info.last_try >= now - TEST_WINDOW_SECS
                        && incumbent_info.last_try > incumbent_info.last_success
                    {
                        // Incumbent was tested recently and failed.
                        self.move_tried_to_new(incumbent, now);
                        self.make_tried(id);
                        self.tried_collisions.remove(&id);
                    }
                    // Otherwise wait for a feeler to test the incumbent.
                }
            }
        }
    }

    /// The tried incumbent some staged entry wants to evict, for a
    /// feeler connection to test. Returns (address, last_try).
    pub fn select_tried_collision(&mut self) -> Option<(NetAddress, i64)> {
        if self.tried_collisions.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.tried_collisions.len());
        let id = *self.tried_collisions.iter().nth(index).expect("non-empty");
        let info = self.slots.get(id).and_then(|s| s.as_ref())?;
        let bucket = self.tried_bucket(&info.address);
        let identity = info.address.identity_key();
        let pos = self.bucket_position(false, bucket, &identity);
        let incumbent = self.tried_buckets[bucket][pos]?;
        let incumbent_info = self.entry(incumbent);
        Some((incumbent_info.address.clone(), incumbent_info.last_try))
    }

    /// Choose an address to connect to.
    pub fn select(&mut self, new_only: bool, now: i64) -> Option<(NetAddress, i64)> {
        if self.size() == 0 {
            return None;
        }
        if new_only && self.new_count == 0 {
            return None;
        }

        // Tried with probability proportional to its share.
        let use_tried = !new_only
            && self.tried_count > 0
            && (self.new_count == 0
                || self
                    .rng
                    .gen_range(0..self.tried_count + self.new_count)
                    < self.tried_count);

        let bucket_count = if use_tried {
            TRIED_BUCKET_COUNT
        } else {
            NEW_BUCKET_COUNT
        };

        // The chosen table is non-empty, so the walk terminates; the
        // growing chance factor caps the expected number of rounds.
        let mut chance_factor = 1.0f64;
        loop {
            let bucket = self.rng.gen_range(0..bucket_count);
            let pos = self.rng.gen_range(0..BUCKET_SIZE);
            let slot = if use_tried {
                self.tried_buckets[bucket][pos]
            } else {
                self.new_buckets[bucket][pos]
            };
            let Some(id) = slot else {
                continue;
            };
            let chance = self.entry(id).chance(now);
            let roll: f64 = self.rng.gen();
            if roll < chance * chance_factor {
                let info = self.entry(id);
                return Some((info.address.clone(), info.last_try));
            }
            chance_factor *= 1.2;
        }
    }

    /// Random sample of stored addresses, bounded by an absolute
    /// count and a percentage of the table.
    pub fn get_addr(
        &mut self,
        max: usize,
        max_pct: usize,
        network: Option<u8>,
        now: i64,
    ) -> Vec<(NetAddress, u64, i64)> {
        let total = self.random_order.len();
        let mut limit = total;
        if max_pct > 0 {
            limit = limit.min(total * max_pct / 100);
        }
        if max > 0 {
            limit = limit.min(max);
        }

        let mut out = Vec::with_capacity(limit);
        let mut cursor = 0usize;
        while out.len() < limit && cursor < total {
            // Partial Fisher-Yates: randomize position `cursor`.
            let swap_with = self.rng.gen_range(cursor..total);
            self.random_order.swap(cursor, swap_with);
            let a = self.random_order[cursor];
            let b = self.random_order[swap_with];
            self.entry_mut(a).random_pos = cursor;
            self.entry_mut(b).random_pos = swap_with;

            let info = self.entry(self.random_order[cursor]);
            cursor += 1;
            if info.is_terrible(now) {
                continue;
            }
            if let Some(network) = network {
                if info.address.network_id() != network {
                    continue;
                }
            }
            out.push((info.address.clone(), info.services, info.last_seen));
        }
        out
    }

    // Support for persistence: controlled re-placement of
    // deserialized entries.

    pub(super) fn slots_iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
    }

    pub(super) fn slots_get(&self, id: usize) -> &AddrInfo {
        self.entry(id)
    }

    pub(super) fn contains_identity(&self, identity: &[u8]) -> bool {
        self.by_identity.contains_key(identity)
    }

    pub(super) fn create_slot(&mut self, info: AddrInfo) -> usize {
        self.create(info)
    }

    /// Restore a tried entry into its computed slot, falling back to
    /// the new table when the slot is unexpectedly taken.
    pub(super) fn restore_tried(&mut self, id: usize) {
        let (bucket, pos) = {
            let info = self.entry(id);
            let bucket = self.tried_bucket(&info.address);
            let identity = info.address.identity_key();
            (bucket, self.bucket_position(false, bucket, &identity))
        };
        if self.tried_buckets[bucket][pos].is_none() {
            self.make_tried(id);
        } else {
            self.restore_fresh(id);
        }
    }

    /// Restore one recorded new-table reference.
    pub(super) fn restore_new_ref(&mut self, id: usize, bucket: usize) -> bool {
        let identity = self.entry(id).address.identity_key();
        let pos = self.bucket_position(true, bucket, &identity);
        if self.new_buckets[bucket][pos].is_none() {
            self.new_buckets[bucket][pos] = Some(id);
            self.entry_mut(id).ref_count += 1;
            true
        } else {
            false
        }
    }

    /// Place a restored entry by the normal insertion rule.
    pub(super) fn restore_fresh(&mut self, id: usize) {
        let now = self.entry(id).last_seen;
        self.insert_into_new_bucket(id, now);
    }

    /// Test support: where does an address live?
    pub fn find_entry(&self, address: &NetAddress) -> Option<(bool, u32)> {
        let id = *self.by_identity.get(&address.identity_key())?;
        let info = self.entry(id);
        Some((info.in_tried, info.ref_count))
    }
}

impl Default for AddrMan {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AddrMan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrMan")
            .field("new", &self.new_count)
            .field("tried", &self.tried_count)
            .field("collisions", &self.tried_collisions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000;

    fn deterministic() -> AddrMan {
        AddrMan::with_key([7u8; 32], StdRng::seed_from_u64(1234))
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> NetAddress {
        NetAddress::ipv4(Ipv4Addr::new(a, b, c, d), 8333)
    }

    fn source() -> NetAddress {
        addr(9, 9, 9, 9)
    }

    #[test]
    fn test_add_and_size() {
        let mut addrman = deterministic();
        let added = addrman.add(
            &[(addr(1, 2, 3, 4), 1, NOW), (addr(5, 6, 7, 8), 1, NOW)],
            &source(),
            0,
            NOW,
        );
        assert_eq!(added, 2);
        assert_eq!(addrman.size(), 2);
        assert_eq!(addrman.new_count(), 2);
        assert_eq!(addrman.tried_count(), 0);
    }

    #[test]
    fn test_unroutable_rejected() {
        let mut addrman = deterministic();
        let added = addrman.add(&[(addr(127, 0, 0, 1), 1, NOW)], &source(), 0, NOW);
        assert_eq!(added, 0);
        assert_eq!(addrman.size(), 0);
    }

    #[test]
    fn test_good_moves_to_tried_once() {
        let mut addrman = deterministic();
        let target = addr(1, 2, 3, 4);
        addrman.add(&[(target.clone(), 1, NOW)], &source(), 0, NOW);

        assert!(addrman.good(&target, NOW));
        assert_eq!(addrman.tried_count(), 1);
        assert_eq!(addrman.new_count(), 0);
        let (in_tried, ref_count) = addrman.find_entry(&target).unwrap();
        assert!(in_tried);
        assert_eq!(ref_count, 0);

        // Idempotent: applying again only refreshes times.
        assert!(!addrman.good(&target, NOW + 10));
        assert_eq!(addrman.tried_count(), 1);
        assert_eq!(addrman.size(), 1);
    }

    #[test]
    fn test_tried_multiplicity_is_one() {
        let mut addrman = deterministic();
        let target = addr(1, 2, 3, 4);
        // Insert from many sources to build multiplicity.
        for i in 0..20u8 {
            addrman.add(&[(target.clone(), 1, NOW)], &addr(10 + i, 1, 1, 1), 0, NOW);
        }
        let (_, refs_before) = addrman.find_entry(&target).unwrap();
        assert!(refs_before >= 1);
        assert!(refs_before <= NEW_BUCKETS_PER_ADDRESS);

        addrman.good(&target, NOW);
        let (in_tried, refs_after) = addrman.find_entry(&target).unwrap();
        assert!(in_tried);
        assert_eq!(refs_after, 0);
    }

    #[test]
    fn test_new_multiplicity_bounded() {
        let mut addrman = deterministic();
        let target = addr(1, 2, 3, 4);
        for i in 0..200u16 {
            let src = addr((i / 250) as u8 + 20, (i % 250) as u8, 1, 1);
            addrman.add(&[(target.clone(), 1, NOW)], &src, 0, NOW);
        }
        let (in_tried, refs) = addrman.find_entry(&target).unwrap();
        assert!(!in_tried);
        assert!(refs <= NEW_BUCKETS_PER_ADDRESS);
        // Still a single logical entry.
        assert_eq!(addrman.size(), 1);
    }

    #[test]
    fn test_select_returns_stored_address() {
        let mut addrman = deterministic();
        let target = addr(1, 2, 3, 4);
        addrman.add(&[(target.clone(), 1, NOW)], &source(), 0, NOW);

        let (selected, _) = addrman.select(false, NOW).unwrap();
        assert_eq!(selected, target);

        // new_only also works since the entry is in new.
        let (selected, _) = addrman.select(true, NOW).unwrap();
        assert_eq!(selected, target);
    }

    #[test]
    fn test_select_empty() {
        let mut addrman = deterministic();
        assert!(addrman.select(false, NOW).is_none());
    }

    #[test]
    fn test_get_addr_respects_caps() {
        let mut addrman = deterministic();
        let mut addrs = Vec::new();
        for i in 0..100u8 {
            addrs.push((addr(50, i, 1, 1), 1u64, NOW));
        }
        addrman.add(&addrs, &source(), 0, NOW);
        let total = addrman.size();
        assert!(total > 50, "most inserts should land");

        // 23% cap.
        let sample = addrman.get_addr(1000, 23, None, NOW);
        assert_eq!(sample.len(), total * 23 / 100);

        // Absolute cap.
        let sample = addrman.get_addr(5, 100, None, NOW);
        assert_eq!(sample.len(), 5);
    }

    #[test]
    fn test_get_addr_skips_terrible() {
        let mut addrman = deterministic();
        let stale = addr(1, 2, 3, 4);
        // Stale last-seen far beyond the horizon.
        addrman.add(&[(stale, 1, NOW - HORIZON_SECS - 100)], &source(), 0, NOW);
        let fresh = addr(5, 6, 7, 8);
        addrman.add(&[(fresh.clone(), 1, NOW)], &source(), 0, NOW);

        let sample = addrman.get_addr(10, 100, None, NOW);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].0, fresh);
    }

    #[test]
    fn test_attempt_counts_failures() {
        let mut addrman = deterministic();
        let target = addr(1, 2, 3, 4);
        addrman.add(&[(target.clone(), 1, NOW)], &source(), 0, NOW);
        addrman.attempt(&target, true, NOW + 10);
        addrman.attempt(&target, true, NOW + 20);
        addrman.attempt(&target, false, NOW + 30);

        // Three failed attempts with no success makes it terrible.
        addrman.attempt(&target, true, NOW + 40);
        let sample = addrman.get_addr(10, 100, None, NOW + 4000);
        assert!(sample.is_empty());
    }

    #[test]
    fn test_collision_staged_then_resolved() {
        let mut addrman = deterministic();

        // Fill tried with addresses until a collision gets staged.
        let mut staged_any = false;
        for i in 0..=255u8 {
            for j in 0..4u8 {
                let candidate = addr(60, i, j, 1);
                addrman.add(&[(candidate.clone(), 1, NOW)], &source(), 0, NOW);
                let promoted = addrman.good(&candidate, NOW);
                if !promoted && !addrman.entry_is_tried(&candidate) {
                    staged_any = true;
                }
            }
        }
        assert!(staged_any, "expected at least one tried collision");
        assert!(addrman.select_tried_collision().is_some());

        // Incumbents all succeeded just now, so resolution keeps them.
        addrman.resolve_collisions(NOW + 10);
        assert!(addrman.select_tried_collision().is_none());
    }

    #[test]
    fn test_collision_evicts_failed_incumbent() {
        let mut addrman = deterministic();
        let mut staged: Option<NetAddress> = None;
        let mut incumbent: Option<NetAddress> = None;

        'outer: for i in 0..=255u8 {
            for j in 0..8u8 {
                let candidate = addr(60, i, j, 1);
                addrman.add(&[(candidate.clone(), 1, NOW)], &source(), 0, NOW);
                if !addrman.good(&candidate, NOW) && !addrman.entry_is_tried(&candidate) {
                    staged = Some(candidate);
                    incumbent = addrman.select_tried_collision().map(|(a, _)| a);
                    break 'outer;
                }
            }
        }
        let staged = staged.expect("collision found");
        let incumbent = incumbent.expect("incumbent found");

        // The incumbent fails a fresh attempt; resolution now swaps.
        let later = NOW + 100;
        addrman.attempt(&incumbent, true, later);
        addrman.resolve_collisions(later + 10);

        assert!(addrman.entry_is_tried(&staged));
        assert!(!addrman.entry_is_tried(&incumbent));
    }

    impl AddrMan {
        fn entry_is_tried(&self, address: &NetAddress) -> bool {
            self.find_entry(address).map(|(t, _)| t).unwrap_or(false)
        }
    }
}
