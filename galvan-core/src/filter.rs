//! Golomb-coded set block filters (BIP 158).
//!
//! Elements are hashed into `[0, N·M)` with keyed SipHash, sorted, and
//! the deltas Golomb-Rice coded with parameter `P`. Matching decodes
//! the filter once and co-iterates it against the sorted query hashes.

use std::collections::BTreeSet;

use crate::crypto::hashing::{sha256d, sha256d_pair};
use crate::crypto::siphash::{fast_range64, siphash};
use crate::error::DecodeError;
use crate::serialization::{Decoder, Encoder};
use crate::transaction::Transaction;
use crate::{Block, Hash256};

/// Golomb-Rice parameter for the BASIC filter type.
pub const BASIC_FILTER_P: u8 = 19;

/// False-positive scaling factor for the BASIC filter type.
pub const BASIC_FILTER_M: u64 = 784_931;

/// Parameters fixing a filter's hash keys and coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcsFilterParams {
    pub siphash_k0: u64,
    pub siphash_k1: u64,
    /// Golomb-Rice remainder width in bits.
    pub p: u8,
    /// Inverse false-positive rate.
    pub m: u64,
}

impl GcsFilterParams {
    /// BASIC filter parameters keyed by a block hash (first 16 bytes,
    /// read as two little-endian words).
    pub fn basic(block_hash: &Hash256) -> Self {
        let k0 = u64::from_le_bytes(block_hash[0..8].try_into().expect("8 bytes"));
        let k1 = u64::from_le_bytes(block_hash[8..16].try_into().expect("8 bytes"));
        Self {
            siphash_k0: k0,
            siphash_k1: k1,
            p: BASIC_FILTER_P,
            m: BASIC_FILTER_M,
        }
    }
}

/// Bit-granular writer over an [`Encoder`].
struct BitWriter<'a> {
    enc: &'a mut Encoder,
    buffer: u8,
    /// Bits currently held in `buffer`.
    count: u8,
}

impl<'a> BitWriter<'a> {
    fn new(enc: &'a mut Encoder) -> Self {
        Self {
            enc,
            buffer: 0,
            count: 0,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        self.buffer |= (bit as u8) << (7 - self.count);
        self.count += 1;
        if self.count == 8 {
            self.enc.write_u8(self.buffer);
            self.buffer = 0;
            self.count = 0;
        }
    }

    /// Write the low `bits` bits of `value`, most significant first.
    fn write_bits(&mut self, value: u64, bits: u8) {
        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn flush(&mut self) {
        if self.count > 0 {
            self.enc.write_u8(self.buffer);
            self.buffer = 0;
            self.count = 0;
        }
    }
}

/// Bit-granular reader over a byte slice.
struct BitReader<'a> {
    data: &'a [u8],
    /// Absolute bit position.
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, DecodeError> {
        let byte = self.pos / 8;
        if byte >= self.data.len() {
            return Err(DecodeError::UnexpectedEnd {
                needed: 1,
                available: 0,
            });
        }
        let bit = (self.data[byte] >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, bits: u8) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    /// Whether fewer than 8 unread bits remain (the legal padding).
    fn at_padding(&self) -> bool {
        self.data.len() * 8 - self.pos < 8
    }
}

fn golomb_rice_encode(writer: &mut BitWriter<'_>, p: u8, value: u64) {
    let quotient = value >> p;
    for _ in 0..quotient {
        writer.write_bit(true);
    }
    writer.write_bit(false);
    writer.write_bits(value, p);
}

fn golomb_rice_decode(reader: &mut BitReader<'_>, p: u8) -> Result<u64, DecodeError> {
    let mut quotient = 0u64;
    while reader.read_bit()? {
        quotient += 1;
        if quotient > (1 << 24) {
            return Err(DecodeError::InvalidValue("golomb-rice quotient"));
        }
    }
    let remainder = reader.read_bits(p)?;
    Ok((quotient << p) | remainder)
}

/// An encoded Golomb-coded set with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsFilter {
    params: GcsFilterParams,
    /// Element count, also encoded as the filter's compact-size prefix.
    n: u32,
    /// Hash range: `n * m`.
    f: u64,
    encoded: Vec<u8>,
}

impl GcsFilter {
    /// Build a filter over a set of elements.
    pub fn from_elements(params: GcsFilterParams, elements: &BTreeSet<Vec<u8>>) -> Self {
        let n = elements.len() as u32;
        let f = n as u64 * params.m;

        let mut enc = Encoder::new();
        enc.write_compact_size(n as u64);

        if n > 0 {
            let mut hashed: Vec<u64> = elements
                .iter()
                .map(|element| hash_to_range(&params, f, element))
                .collect();
            hashed.sort_unstable();

            let mut writer = BitWriter::new(&mut enc);
            let mut last = 0u64;
            for value in hashed {
                golomb_rice_encode(&mut writer, params.p, value.wrapping_sub(last));
                last = value;
            }
            writer.flush();
        }

        Self {
            params,
            n,
            f,
            encoded: enc.into_inner(),
        }
    }

    /// Adopt an already-encoded filter, verifying that it decodes to
    /// exactly `N` elements with no excess data unless `skip_check`.
    pub fn from_encoded(
        params: GcsFilterParams,
        encoded: Vec<u8>,
        skip_check: bool,
    ) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(&encoded);
        let n64 = dec.read_compact_size()?;
        let n = u32::try_from(n64).map_err(|_| DecodeError::InvalidValue("element count"))?;
        let f = n as u64 * params.m;
        let body_offset = encoded.len() - dec.remaining();

        if !skip_check {
            let mut reader = BitReader::new(&encoded[body_offset..]);
            for _ in 0..n {
                golomb_rice_decode(&mut reader, params.p)?;
            }
            if !reader.at_padding() {
                return Err(DecodeError::TrailingData);
            }
        }

        Ok(Self {
            params,
            n,
            f,
            encoded,
        })
    }

    /// Number of elements.
    pub fn element_count(&self) -> u32 {
        self.n
    }

    /// The raw encoded bytes (compact-size count + bit stream).
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Hash of the encoded filter, used in the filter header chain.
    pub fn filter_hash(&self) -> Hash256 {
        sha256d(&self.encoded)
    }

    /// Test a single element for (probabilistic) membership.
    pub fn matches(&self, element: &[u8]) -> Result<bool, DecodeError> {
        let query = hash_to_range(&self.params, self.f, element);
        self.match_sorted(&[query])
    }

    /// Test whether any of the elements may be in the set.
    pub fn matches_any(&self, elements: &BTreeSet<Vec<u8>>) -> Result<bool, DecodeError> {
        let mut queries: Vec<u64> = elements
            .iter()
            .map(|element| hash_to_range(&self.params, self.f, element))
            .collect();
        queries.sort_unstable();
        self.match_sorted(&queries)
    }

    /// Co-iterate the decoded set against sorted query hashes.
    fn match_sorted(&self, queries: &[u64]) -> Result<bool, DecodeError> {
        let mut dec = Decoder::new(&self.encoded);
        let _ = dec.read_compact_size()?;
        let body_offset = self.encoded.len() - dec.remaining();
        let mut reader = BitReader::new(&self.encoded[body_offset..]);

        let mut value = 0u64;
        let mut index = 0usize;
        for _ in 0..self.n {
            value = value.wrapping_add(golomb_rice_decode(&mut reader, self.params.p)?);
            loop {
                match queries.get(index) {
                    None => return Ok(false),
                    Some(&query) if query == value => return Ok(true),
                    Some(&query) if query > value => break,
                    Some(_) => index += 1,
                }
            }
        }
        Ok(false)
    }

    /// Decode the full sorted hash set (test support).
    pub fn decode_hashes(&self) -> Result<Vec<u64>, DecodeError> {
        let mut dec = Decoder::new(&self.encoded);
        let _ = dec.read_compact_size()?;
        let body_offset = self.encoded.len() - dec.remaining();
        let mut reader = BitReader::new(&self.encoded[body_offset..]);
        let mut hashes = Vec::with_capacity(self.n as usize);
        let mut value = 0u64;
        for _ in 0..self.n {
            value = value.wrapping_add(golomb_rice_decode(&mut reader, self.params.p)?);
            hashes.push(value);
        }
        Ok(hashes)
    }
}

fn hash_to_range(params: &GcsFilterParams, f: u64, element: &[u8]) -> u64 {
    fast_range64(siphash(params.siphash_k0, params.siphash_k1, element), f)
}

/// A BASIC block filter bound to its block hash.
#[derive(Debug, Clone)]
pub struct BlockFilter {
    block_hash: Hash256,
    filter: GcsFilter,
}

impl BlockFilter {
    /// Build the BASIC filter for a block.
    ///
    /// Elements are the scripts of all created outputs (excluding
    /// empty scripts and those starting with OP_RETURN) plus the
    /// scripts of all spent prevouts, supplied by the caller since the
    /// core does not track the UTXO set.
    pub fn basic(block: &Block, spent_scripts: &[Vec<u8>]) -> Self {
        let block_hash = block.hash();
        let elements = basic_filter_elements(&block.transactions, spent_scripts);
        Self {
            block_hash,
            filter: GcsFilter::from_elements(GcsFilterParams::basic(&block_hash), &elements),
        }
    }

    /// Adopt an encoded filter received from the network.
    pub fn from_encoded(
        block_hash: Hash256,
        encoded: Vec<u8>,
        skip_check: bool,
    ) -> Result<Self, DecodeError> {
        let filter = GcsFilter::from_encoded(GcsFilterParams::basic(&block_hash), encoded, skip_check)?;
        Ok(Self { block_hash, filter })
    }

    pub fn block_hash(&self) -> &Hash256 {
        &self.block_hash
    }

    pub fn filter(&self) -> &GcsFilter {
        &self.filter
    }

    /// Hash of the encoded filter.
    pub fn filter_hash(&self) -> Hash256 {
        self.filter.filter_hash()
    }

    /// Chain this filter's hash onto the previous filter header.
    pub fn compute_header(&self, prev_header: &Hash256) -> Hash256 {
        sha256d_pair(&self.filter_hash(), prev_header)
    }
}

/// Collect the BASIC filter element set.
fn basic_filter_elements(
    transactions: &[Transaction],
    spent_scripts: &[Vec<u8>],
) -> BTreeSet<Vec<u8>> {
    const OP_RETURN: u8 = 0x6a;

    let mut elements = BTreeSet::new();
    for tx in transactions {
        for output in &tx.outputs {
            let script = &output.script_pubkey;
            if script.is_empty() || script[0] == OP_RETURN {
                continue;
            }
            elements.insert(script.clone());
        }
    }
    for script in spent_scripts {
        if script.is_empty() {
            continue;
        }
        elements.insert(script.clone());
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZERO_HASH;

    fn zero_key_params() -> GcsFilterParams {
        GcsFilterParams {
            siphash_k0: 0,
            siphash_k1: 0,
            p: BASIC_FILTER_P,
            m: BASIC_FILTER_M,
        }
    }

    fn element(first: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        bytes[0] = first;
        bytes
    }

    #[test]
    fn test_empty_filter() {
        let filter = GcsFilter::from_elements(zero_key_params(), &BTreeSet::new());
        assert_eq!(filter.element_count(), 0);
        assert_eq!(filter.encoded(), &[0u8]);
        assert!(!filter.matches(&element(1)).unwrap());
    }

    #[test]
    fn test_members_match() {
        let mut elements = BTreeSet::new();
        elements.insert(element(0x00));
        elements.insert(element(0x01));
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);

        assert!(filter.matches(&element(0x00)).unwrap());
        assert!(filter.matches(&element(0x01)).unwrap());
        assert!(filter.matches_any(&elements).unwrap());
    }

    #[test]
    fn test_non_member_false_positive_rate() {
        let mut elements = BTreeSet::new();
        elements.insert(element(0x00));
        elements.insert(element(0x01));
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);

        // With P = 19 the false positive rate is 2^-19 per query;
        // 1000 random non-members should see at most one hit.
        let mut hits = 0;
        for i in 0..1000u32 {
            let mut probe = vec![0xffu8; 32];
            probe[1..5].copy_from_slice(&i.to_le_bytes());
            if filter.matches(&probe).unwrap() {
                hits += 1;
            }
        }
        assert!(hits <= 1, "false positive rate too high: {hits}/1000");
    }

    #[test]
    fn test_decode_matches_hashed_set() {
        let params = zero_key_params();
        let mut elements = BTreeSet::new();
        for i in 0..50u8 {
            elements.insert(element(i));
        }
        let filter = GcsFilter::from_elements(params, &elements);

        let mut expected: Vec<u64> = elements
            .iter()
            .map(|e| hash_to_range(&params, 50 * params.m, e))
            .collect();
        expected.sort_unstable();
        assert_eq!(filter.decode_hashes().unwrap(), expected);
    }

    #[test]
    fn test_encoded_roundtrip() {
        let mut elements = BTreeSet::new();
        for i in 0..10u8 {
            elements.insert(element(i));
        }
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);
        let adopted =
            GcsFilter::from_encoded(zero_key_params(), filter.encoded().to_vec(), false).unwrap();
        assert_eq!(adopted, filter);
    }

    #[test]
    fn test_excess_data_rejected() {
        let mut elements = BTreeSet::new();
        elements.insert(element(1));
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);
        let mut encoded = filter.encoded().to_vec();
        encoded.push(0xab);
        encoded.push(0xcd);
        assert!(GcsFilter::from_encoded(zero_key_params(), encoded, false).is_err());
    }

    #[test]
    fn test_truncated_filter_rejected() {
        let mut elements = BTreeSet::new();
        for i in 0..20u8 {
            elements.insert(element(i));
        }
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);
        let encoded = filter.encoded()[..filter.encoded().len() / 2].to_vec();
        assert!(GcsFilter::from_encoded(zero_key_params(), encoded, false).is_err());
    }

    #[test]
    fn test_filter_header_chain() {
        let mut elements = BTreeSet::new();
        elements.insert(element(7));
        let filter = GcsFilter::from_elements(zero_key_params(), &elements);

        // Genesis header hashes against the zero header.
        let genesis_header = sha256d_pair(&filter.filter_hash(), &ZERO_HASH);
        let next_header = sha256d_pair(&filter.filter_hash(), &genesis_header);
        assert_ne!(genesis_header, next_header);
    }

    #[test]
    fn test_basic_filter_skips_op_return_and_empty() {
        use crate::transaction::{OutPoint, TxIn, TxOut};
        use crate::BlockHeader;

        let tx = Transaction {
            version: 2,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: ZERO_HASH,
                    vout: 0xffff_ffff,
                },
                script_sig: vec![],
                sequence: 0,
                witness: Vec::new(),
            }],
            outputs: vec![
                TxOut {
                    value: 1,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![0x6a, 0x01, 0x02], // OP_RETURN
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![], // empty
                },
            ],
            lock_time: 0,
        };
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_blockhash: ZERO_HASH,
                merkle_root: ZERO_HASH,
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![tx],
        };

        let filter = BlockFilter::basic(&block, &[]);
        assert_eq!(filter.filter().element_count(), 1);
        assert!(filter.filter().matches(&[0x51]).unwrap());
    }
}
