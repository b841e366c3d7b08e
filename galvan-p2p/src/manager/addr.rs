//! Address gossip: `addr` / `addrv2` / `getaddr` processing and
//! deterministic forwarding.

use std::time::Duration;

use crate::config::{
    ADDR_TIME_PENALTY, MAX_ADDR_PROCESSING_TOKEN_BUCKET, MAX_ADDR_RATE_PER_SECOND,
    MAX_ADDR_TO_SEND, MAX_PCT_ADDR_TO_SEND, ROTATE_ADDR_RELAY_DEST_INTERVAL,
};
use crate::manager::PeerManager;
use crate::peer::{ConnectionDirection, Peer};
use crate::protocol::TimedAddress;

/// Domain separator for the address-relay randomizer.
const RANDOMIZER_ID_ADDRESS_RELAY: u64 = 0x3cac0035b5866b90;

/// How fresh an address must be to be forwarded onward.
const FORWARD_MAX_AGE_SECS: i64 = 10 * 60;

/// Largest batch that still gets forwarded peer-to-peer.
const FORWARD_MAX_COUNT: usize = 10;

impl PeerManager {
    pub(crate) fn handle_addr_list(
        &self,
        peer: &Peer,
        entries: Vec<TimedAddress>,
        via_v2: bool,
        now: Duration,
        wall: i64,
    ) {
        if !peer.direction.can_relay_addr() {
            tracing::debug!(peer = %peer.id, "ignoring addresses from non-addr-relay peer");
            return;
        }
        if entries.len() > MAX_ADDR_TO_SEND {
            self.misbehaving(peer, 20, "oversized addr message");
            return;
        }
        peer.init_addr_relay();

        let mut accepted: Vec<(crate::protocol::NetAddress, u64, i64)> = Vec::new();
        let mut to_forward: Vec<TimedAddress> = Vec::new();
        {
            let mut guard = peer.addr_relay.lock().expect("addr relay lock");
            let Some(relay) = guard.as_mut() else {
                return;
            };

            // Refill the rate-limit bucket.
            if let Some(last) = relay.last_refill {
                let elapsed = now.saturating_sub(last).as_secs_f64();
                relay.token_bucket = (relay.token_bucket
                    + elapsed * MAX_ADDR_RATE_PER_SECOND)
                    .min(MAX_ADDR_PROCESSING_TOKEN_BUCKET);
            }
            relay.last_refill = Some(now);

            let forward_eligible = entries.len() <= FORWARD_MAX_COUNT;
            for entry in entries {
                if self.interrupted() {
                    return;
                }
                if relay.token_bucket < 1.0 {
                    relay.addrs_rate_limited += 1;
                    continue;
                }
                relay.token_bucket -= 1.0;
                relay.addrs_processed += 1;

                if !entry.address.is_routable() {
                    continue;
                }
                relay.known.insert(entry.address.identity_key());

                if let Some(banman) = &self.banman {
                    if banman.is_banned(&entry.address) || banman.is_discouraged(&entry.address)
                    {
                        continue;
                    }
                }

                // Clamp silly timestamps to "five days ago".
                let mut seen = entry.time as i64;
                if seen > wall + FORWARD_MAX_AGE_SECS || seen < 100_000_000 {
                    seen = wall - 5 * 24 * 60 * 60;
                }

                // Addresses advertising themselves skip the
                // third-party time penalty.
                let penalty = if entry.address == peer.address {
                    0
                } else {
                    ADDR_TIME_PENALTY
                };
                accepted.push((entry.address.clone(), entry.services, seen - penalty));

                if forward_eligible && seen > wall - FORWARD_MAX_AGE_SECS {
                    to_forward.push(entry);
                }
            }
        }

        let added = self.with_addrman(|addrman| addrman.add(&accepted, &peer.address, 0, wall));
        tracing::trace!(
            peer = %peer.id,
            received = accepted.len(),
            added,
            v2 = via_v2,
            "processed addresses"
        );

        for entry in to_forward {
            self.forward_address(peer, entry, wall);
        }

        // Addr-fetch connections exist only to harvest addresses.
        if peer.direction == ConnectionDirection::AddrFetch && !accepted.is_empty() {
            tracing::debug!(peer = %peer.id, "addr-fetch complete");
            self.connman.disconnect(peer.id);
        }
    }

    /// Relay one fresh address to two peers, chosen by a keyed hash
    /// stable for 24 hours so spies cannot map the topology.
    pub(crate) fn forward_address(&self, source: &Peer, entry: TimedAddress, wall: i64) {
        let epoch = (wall / ROTATE_ADDR_RELAY_DEST_INTERVAL.as_secs() as i64) as u64;
        let mut base = self.deterministic_randomizer(RANDOMIZER_ID_ADDRESS_RELAY);
        base.write_u64(epoch);
        base.write(&entry.address.identity_key());

        let mut best: Vec<(u64, std::sync::Arc<Peer>)> = Vec::new();
        for candidate in self.all_peers() {
            if candidate.id == source.id
                || !candidate.is_fully_connected()
                || !candidate.direction.can_relay_addr()
            {
                continue;
            }
            let mut hasher = base.clone();
            hasher.write_u64(candidate.id.0);
            let score = hasher.finalize();
            best.push((score, candidate));
            best.sort_by_key(|(score, _)| *score);
            best.truncate(2);
        }

        let mut rng = rand::thread_rng();
        for (_, candidate) in best {
            candidate.init_addr_relay();
            let mut guard = candidate.addr_relay.lock().expect("addr relay lock");
            if let Some(relay) = guard.as_mut() {
                relay.push_addr(entry.clone(), &mut rng);
            }
        }
    }

    pub(crate) fn handle_getaddr(&self, peer: &Peer, _now: Duration, wall: i64) {
        // Only inbound peers get an answer: responding on outbound
        // connections would let an attacker fingerprint us by our
        // table contents.
        if peer.direction.is_outbound() {
            tracing::debug!(peer = %peer.id, "ignoring getaddr on outbound connection");
            return;
        }
        peer.init_addr_relay();
        {
            let mut guard = peer.addr_relay.lock().expect("addr relay lock");
            let Some(relay) = guard.as_mut() else {
                return;
            };
            if relay.getaddr_answered {
                tracing::debug!(peer = %peer.id, "ignoring repeated getaddr");
                return;
            }
            relay.getaddr_answered = true;
        }

        let sample = self.with_addrman(|addrman| {
            addrman.get_addr(MAX_ADDR_TO_SEND, MAX_PCT_ADDR_TO_SEND, None, wall)
        });
        let mut rng = rand::thread_rng();
        let mut guard = peer.addr_relay.lock().expect("addr relay lock");
        if let Some(relay) = guard.as_mut() {
            for (address, services, last_seen) in sample {
                relay.push_addr(
                    TimedAddress {
                        time: last_seen.clamp(0, u32::MAX as i64) as u32,
                        services,
                        address,
                    },
                    &mut rng,
                );
            }
        }
    }
}
