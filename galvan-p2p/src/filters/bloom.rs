//! BIP 37 bloom filters.
//!
//! Loaded by light clients via `filterload` so we only relay
//! transactions relevant to them. The hash family is MurmurHash3 over
//! a per-filter tweak. Oversized filters are a protocol violation
//! handled by the caller.

use galvan_core::{Encoder, Hash256, Transaction};

/// Maximum serialized filter size in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Maximum size of a `filteradd` data element.
pub const MAX_FILTER_ADD_SIZE: usize = 520;

/// MurmurHash3 32-bit, as used by BIP 37.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().expect("4 bytes"));
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 = (h1 ^ k1).rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k1 = 0u32;
    for (i, &byte) in chunks.remainder().iter().enumerate() {
        k1 |= (byte as u32) << (8 * i);
    }
    if k1 != 0 {
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

/// A peer-supplied bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    /// Adopt a filter from a `filterload` message.
    pub fn from_load(data: Vec<u8>, hash_funcs: u32, tweak: u32) -> Self {
        Self {
            data,
            hash_funcs,
            tweak,
        }
    }

    /// Whether the filter respects the protocol size limits.
    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn bit_index(&self, n: u32, element: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xfba4c795).wrapping_add(self.tweak);
        (murmur3(seed, element) as usize) % (self.data.len() * 8)
    }

    /// Insert a data element.
    pub fn insert(&mut self, element: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, element);
            self.data[index / 8] |= 1 << (index % 8);
        }
    }

    /// Probabilistic membership test.
    pub fn contains(&self, element: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|n| {
            let index = self.bit_index(n, element);
            self.data[index / 8] & (1 << (index % 8)) != 0
        })
    }

    /// Whether a transaction is relevant to the filter: matches its
    /// txid, any spent outpoint, or any output script.
    pub fn is_relevant(&self, tx: &Transaction, txid: &Hash256) -> bool {
        if self.contains(txid) {
            return true;
        }
        for output in &tx.outputs {
            if !output.script_pubkey.is_empty() && self.contains(&output.script_pubkey) {
                return true;
            }
        }
        for input in &tx.inputs {
            let mut enc = Encoder::with_capacity(36);
            input.prevout.consensus_encode(&mut enc);
            if self.contains(&enc.into_inner()) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_values() {
        // Vectors from the MurmurHash3 reference implementation.
        assert_eq!(murmur3(0, b""), 0);
        assert_eq!(murmur3(1, b""), 0x514e28b7);
        assert_eq!(murmur3(0, b"\xff\xff\xff\xff"), 0x76293b50);
    }

    #[test]
    fn test_insert_and_contains() {
        let mut filter = BloomFilter::from_load(vec![0u8; 128], 11, 0);
        let element = b"some element";

        assert!(!filter.contains(element));
        filter.insert(element);
        assert!(filter.contains(element));
        assert!(!filter.contains(b"another element"));
    }

    #[test]
    fn test_tweak_changes_bits() {
        let mut a = BloomFilter::from_load(vec![0u8; 64], 5, 0);
        let mut b = BloomFilter::from_load(vec![0u8; 64], 5, 12345);
        a.insert(b"x");
        b.insert(b"x");
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_size_constraints() {
        let ok = BloomFilter::from_load(vec![0u8; MAX_BLOOM_FILTER_SIZE], 50, 0);
        assert!(ok.is_within_size_constraints());

        let too_big = BloomFilter::from_load(vec![0u8; MAX_BLOOM_FILTER_SIZE + 1], 1, 0);
        assert!(!too_big.is_within_size_constraints());

        let too_many = BloomFilter::from_load(vec![0u8; 8], MAX_HASH_FUNCS + 1, 0);
        assert!(!too_many.is_within_size_constraints());
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let filter = BloomFilter::from_load(Vec::new(), 11, 0);
        assert!(!filter.contains(b"anything"));
    }

    #[test]
    fn test_relevant_by_output_script() {
        use galvan_core::{OutPoint, TxIn, TxOut};

        let script = vec![0x76, 0xa9, 0x14, 0x01];
        let tx = Transaction {
            version: 2,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: [1u8; 32],
                    vout: 0,
                },
                script_sig: vec![],
                sequence: 0,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 1,
                script_pubkey: script.clone(),
            }],
            lock_time: 0,
        };
        let txid = tx.txid();

        let mut filter = BloomFilter::from_load(vec![0u8; 256], 11, 7);
        assert!(!filter.is_relevant(&tx, &txid));
        filter.insert(&script);
        assert!(filter.is_relevant(&tx, &txid));
    }
}
