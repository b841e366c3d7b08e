//! Block header and block types with consensus encoding.

use primitive_types::U256;

use crate::crypto::hashing::sha256d;
use crate::error::DecodeError;
use crate::serialization::{Decoder, Encoder};
use crate::transaction::Transaction;
use crate::Hash256;

/// Size of an encoded block header.
pub const HEADER_SIZE: usize = 80;

/// An 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version, signalling soft-fork deployments.
    pub version: i32,
    /// Hash of the previous block header.
    pub prev_blockhash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Block timestamp (Unix seconds).
    pub time: u32,
    /// Compact-encoded proof-of-work target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Compute the block hash (double SHA-256 of the 80-byte encoding).
    pub fn hash(&self) -> Hash256 {
        let mut enc = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut enc);
        sha256d(&enc.into_inner())
    }

    /// Write the 80-byte consensus encoding.
    pub fn consensus_encode(&self, enc: &mut Encoder) {
        enc.write_i32_le(self.version);
        enc.write_bytes(&self.prev_blockhash);
        enc.write_bytes(&self.merkle_root);
        enc.write_u32_le(self.time);
        enc.write_u32_le(self.bits);
        enc.write_u32_le(self.nonce);
    }

    /// Read the 80-byte consensus encoding.
    pub fn consensus_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: dec.read_i32_le()?,
            prev_blockhash: dec.read_fixed()?,
            merkle_root: dec.read_fixed()?,
            time: dec.read_u32_le()?,
            bits: dec.read_u32_le()?,
            nonce: dec.read_u32_le()?,
        })
    }

    /// Expand the compact `bits` field into a full 256-bit target.
    ///
    /// Returns `None` for negative or overflowing encodings, which can
    /// never be met by any hash.
    pub fn target(&self) -> Option<U256> {
        compact_to_target(self.bits)
    }

    /// Check the header hash against its own declared target.
    pub fn check_pow(&self) -> bool {
        match self.target() {
            Some(target) if !target.is_zero() => {
                U256::from_little_endian(&self.hash()) <= target
            }
            _ => false,
        }
    }

    /// Expected work to produce one header at this difficulty.
    pub fn work(&self) -> U256 {
        match self.target() {
            Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
            _ => U256::zero(),
        }
    }
}

/// Expand a compact target encoding (sign bit means invalid).
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };
    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return None;
        }
    }
    Some(value)
}

/// A full block: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block hash, defined entirely by the header.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Write the consensus encoding (header, tx count, transactions).
    pub fn consensus_encode(&self, enc: &mut Encoder) {
        self.header.consensus_encode(enc);
        enc.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(enc, true);
        }
    }

    /// Read the consensus encoding.
    pub fn consensus_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(dec)?;
        let count = dec.read_size()?;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(dec)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> BlockHeader {
        BlockHeader {
            version: 0x20000000,
            prev_blockhash: [0u8; 32],
            merkle_root: [1u8; 32],
            time: 1700000000,
            bits: 0x207fffff,
            nonce: 0,
        }
    }

    #[test]
    fn test_header_encoding_is_80_bytes() {
        let mut enc = Encoder::new();
        test_header().consensus_encode(&mut enc);
        assert_eq!(enc.len(), HEADER_SIZE);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = test_header();
        let mut enc = Encoder::new();
        header.consensus_encode(&mut enc);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        let decoded = BlockHeader::consensus_decode(&mut dec).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn test_hash_changes_with_nonce() {
        let mut header = test_header();
        let before = header.hash();
        header.nonce = 1;
        assert_ne!(header.hash(), before);
    }

    #[test]
    fn test_compact_target_regtest_limit() {
        // 0x207fffff expands to 0x7fffff << 232.
        let target = compact_to_target(0x207fffff).unwrap();
        assert_eq!(target, U256::from(0x7fffff) << 232);
    }

    #[test]
    fn test_compact_target_negative_rejected() {
        assert!(compact_to_target(0x01803456).is_none());
    }

    #[test]
    fn test_compact_target_overflow_rejected() {
        assert!(compact_to_target(0xff123456).is_none());
    }

    #[test]
    fn test_work_increases_as_target_shrinks() {
        let easy = BlockHeader {
            bits: 0x207fffff,
            ..test_header()
        };
        let hard = BlockHeader {
            bits: 0x1d00ffff,
            ..test_header()
        };
        assert!(hard.work() > easy.work());
        assert!(easy.work() >= U256::one());
    }

    #[test]
    fn test_regtest_pow_minable() {
        // At the 0x207fffff limit roughly every other nonce works, so
        // a handful of attempts always finds a valid one.
        let mut header = test_header();
        let mut attempts = 0;
        while !header.check_pow() {
            header.nonce += 1;
            attempts += 1;
            assert!(attempts < 1000, "regtest target should be easy to hit");
        }
        assert!(header.check_pow());
    }

    #[test]
    fn test_invalid_bits_never_pass_pow() {
        let header = BlockHeader {
            bits: 0,
            ..test_header()
        };
        assert!(header.target().is_none() || header.target() == Some(U256::zero()));
        assert!(!header.check_pow());
    }
}
