//! SipHash-2-4 with explicit 128-bit keys.
//!
//! Used for addrman bucket selection, transaction request tiebreaking,
//! compact block short IDs and the deterministic address-relay
//! randomizer. The streaming form processes whole 8-byte words; the
//! length byte folds into the final word per the SipHash paper.

const fn rotl(value: u64, bits: u32) -> u64 {
    value.rotate_left(bits)
}

macro_rules! sipround {
    ($v0:ident, $v1:ident, $v2:ident, $v3:ident) => {
        $v0 = $v0.wrapping_add($v1);
        $v1 = rotl($v1, 13);
        $v1 ^= $v0;
        $v0 = rotl($v0, 32);
        $v2 = $v2.wrapping_add($v3);
        $v3 = rotl($v3, 16);
        $v3 ^= $v2;
        $v0 = $v0.wrapping_add($v3);
        $v3 = rotl($v3, 21);
        $v3 ^= $v0;
        $v2 = $v2.wrapping_add($v1);
        $v1 = rotl($v1, 17);
        $v1 ^= $v2;
        $v2 = rotl($v2, 32);
    };
}

/// Incremental SipHash-2-4 hasher.
#[derive(Debug, Clone)]
pub struct SipHasher24 {
    v: [u64; 4],
    /// Pending input bytes, low-order first, below one full word.
    tmp: u64,
    /// Total bytes written.
    count: u64,
}

impl SipHasher24 {
    /// Construct with a 128-bit key split into two words.
    pub fn new(k0: u64, k1: u64) -> Self {
        Self {
            v: [
                0x736f6d6570736575 ^ k0,
                0x646f72616e646f6d ^ k1,
                0x6c7967656e657261 ^ k0,
                0x7465646279746573 ^ k1,
            ],
            tmp: 0,
            count: 0,
        }
    }

    fn compress(&mut self, word: u64) {
        let [mut v0, mut v1, mut v2, mut v3] = self.v;
        v3 ^= word;
        sipround!(v0, v1, v2, v3);
        sipround!(v0, v1, v2, v3);
        v0 ^= word;
        self.v = [v0, v1, v2, v3];
    }

    /// Feed a whole 64-bit word. Requires the byte count to be
    /// word-aligned, which holds when only word-based writes are used.
    pub fn write_u64(&mut self, word: u64) -> &mut Self {
        debug_assert_eq!(self.count % 8, 0);
        self.compress(word);
        self.count += 8;
        self
    }

    /// Feed arbitrary bytes.
    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        let mut tmp = self.tmp;
        let mut offset = (self.count % 8) as u32;
        for &byte in data {
            tmp |= (byte as u64) << (8 * offset);
            offset += 1;
            if offset == 8 {
                self.compress(tmp);
                tmp = 0;
                offset = 0;
            }
        }
        self.tmp = tmp;
        self.count += data.len() as u64;
        self
    }

    /// Produce the 64-bit digest. The hasher can keep being written to
    /// afterwards only by cloning before finalizing.
    pub fn finalize(&self) -> u64 {
        let [mut v0, mut v1, mut v2, mut v3] = self.v;
        let final_word = self.tmp | (self.count << 56);
        v3 ^= final_word;
        sipround!(v0, v1, v2, v3);
        sipround!(v0, v1, v2, v3);
        v0 ^= final_word;
        v2 ^= 0xff;
        sipround!(v0, v1, v2, v3);
        sipround!(v0, v1, v2, v3);
        sipround!(v0, v1, v2, v3);
        sipround!(v0, v1, v2, v3);
        v0 ^ v1 ^ v2 ^ v3
    }
}

/// One-shot SipHash-2-4 of a byte slice.
pub fn siphash(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new(k0, k1);
    hasher.write(data);
    hasher.finalize()
}

/// SipHash-2-4 of a 32-byte hash followed by a 32-bit extra value.
///
/// This is the compact-block short ID hash: the block header hash keys
/// the nonce-extended input.
pub fn siphash_u256_extra(k0: u64, k1: u64, value: &[u8; 32], extra: u32) -> u64 {
    let mut hasher = SipHasher24::new(k0, k1);
    hasher.write(value);
    hasher.write(&extra.to_le_bytes());
    hasher.finalize()
}

/// Map a 64-bit hash uniformly onto `[0, range)` without division.
#[inline]
pub fn fast_range64(hash: u64, range: u64) -> u64 {
    ((hash as u128 * range as u128) >> 64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the SipHash paper: key 000102...0f,
    // message 00 01 02 ... of increasing length.
    const VECTORS: [u64; 8] = [
        0x726fdb47dd0e0e31,
        0x74f839c593dc67fd,
        0x0d6c8009d9a94f5a,
        0x85676696d7fb7e2d,
        0xcf2794e0277187b7,
        0x18765564cd99a68d,
        0xcbc9466e58fee3ce,
        0xab0200f58b01d137,
    ];

    const K0: u64 = 0x0706050403020100;
    const K1: u64 = 0x0f0e0d0c0b0a0908;

    #[test]
    fn test_reference_vectors() {
        let message: Vec<u8> = (0u8..8).collect();
        for (len, expected) in VECTORS.iter().enumerate() {
            assert_eq!(
                siphash(K0, K1, &message[..len]),
                *expected,
                "length {len}"
            );
        }
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data: Vec<u8> = (0u8..64).collect();
        let oneshot = siphash(K0, K1, &data);

        let mut hasher = SipHasher24::new(K0, K1);
        hasher.write(&data[..5]);
        hasher.write(&data[5..31]);
        hasher.write(&data[31..]);
        assert_eq!(hasher.finalize(), oneshot);
    }

    #[test]
    fn test_word_writes_match_byte_writes() {
        let mut words = SipHasher24::new(K0, K1);
        words.write_u64(0x0706050403020100);
        words.write_u64(0x0f0e0d0c0b0a0908);

        let bytes: Vec<u8> = (0u8..16).collect();
        assert_eq!(words.finalize(), siphash(K0, K1, &bytes));
    }

    #[test]
    fn test_u256_extra_matches_concatenation() {
        let value = [7u8; 32];
        let extra = 0xdeadbeefu32;
        let mut concat = value.to_vec();
        concat.extend_from_slice(&extra.to_le_bytes());
        assert_eq!(
            siphash_u256_extra(1, 2, &value, extra),
            siphash(1, 2, &concat)
        );
    }

    #[test]
    fn test_fast_range_bounds() {
        for range in [1u64, 2, 3, 1000, u64::MAX] {
            for hash in [0u64, 1, u64::MAX / 2, u64::MAX] {
                assert!(fast_range64(hash, range) < range);
            }
        }
        assert_eq!(fast_range64(u64::MAX, 1), 0);
    }
}
