//! Transaction types, consensus encoding and identifiers.
//!
//! Transactions carry two identifiers: the txid commits to the
//! transaction without witness data, the wtxid includes it. Peers that
//! negotiated wtxid relay announce by wtxid; everything else uses the
//! txid.

use crate::crypto::hashing::sha256d;
use crate::error::DecodeError;
use crate::serialization::{Decoder, Encoder};
use crate::Hash256;

/// A reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn consensus_encode(&self, enc: &mut Encoder) {
        enc.write_bytes(&self.txid);
        enc.write_u32_le(self.vout);
    }

    pub fn consensus_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            txid: dec.read_fixed()?,
            vout: dec.read_u32_le()?,
        })
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack; empty for non-segwit spends.
    pub witness: Vec<Vec<u8>>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Value in the smallest unit.
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Whether any input carries witness data.
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// The witness-stripped identifier.
    pub fn txid(&self) -> Hash256 {
        let mut enc = Encoder::new();
        self.consensus_encode(&mut enc, false);
        sha256d(&enc.into_inner())
    }

    /// The witness-inclusive identifier. Equal to the txid for
    /// transactions without witness data.
    pub fn wtxid(&self) -> Hash256 {
        if !self.has_witness() {
            return self.txid();
        }
        let mut enc = Encoder::new();
        self.consensus_encode(&mut enc, true);
        sha256d(&enc.into_inner())
    }

    /// Write the consensus encoding. With `include_witness`, segwit
    /// transactions get the marker/flag bytes and witness stacks.
    pub fn consensus_encode(&self, enc: &mut Encoder, include_witness: bool) {
        let segwit = include_witness && self.has_witness();
        enc.write_i32_le(self.version);
        if segwit {
            enc.write_u8(0x00);
            enc.write_u8(0x01);
        }
        enc.write_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.consensus_encode(enc);
            enc.write_var_bytes(&input.script_sig);
            enc.write_u32_le(input.sequence);
        }
        enc.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            enc.write_i64_le(output.value);
            enc.write_var_bytes(&output.script_pubkey);
        }
        if segwit {
            for input in &self.inputs {
                enc.write_compact_size(input.witness.len() as u64);
                for item in &input.witness {
                    enc.write_var_bytes(item);
                }
            }
        }
        enc.write_u32_le(self.lock_time);
    }

    /// Read the consensus encoding, accepting both legacy and segwit
    /// layouts.
    pub fn consensus_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = dec.read_i32_le()?;

        let mut input_count = dec.read_size()?;
        let mut segwit = false;
        if input_count == 0 {
            // Either the segwit marker or an empty transaction. A flag
            // byte other than 0x01 is invalid.
            let flag = dec.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidValue("segwit flag"));
            }
            segwit = true;
            input_count = dec.read_size()?;
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let prevout = OutPoint::consensus_decode(dec)?;
            let script_sig = dec.read_var_bytes()?.to_vec();
            let sequence = dec.read_u32_le()?;
            inputs.push(TxIn {
                prevout,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let output_count = dec.read_size()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = dec.read_i64_le()?;
            let script_pubkey = dec.read_var_bytes()?.to_vec();
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if segwit {
            for input in &mut inputs {
                let item_count = dec.read_size()?;
                let mut witness = Vec::with_capacity(item_count.min(32));
                for _ in 0..item_count {
                    witness.push(dec.read_var_bytes()?.to_vec());
                }
                input.witness = witness;
            }
        }

        let lock_time = dec.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

/// A generic transaction identifier: txid or wtxid.
///
/// Announcements from wtxid-relay peers carry wtxids; legacy peers use
/// txids. Tracking code treats the two as distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GenTxId {
    Txid(Hash256),
    Wtxid(Hash256),
}

impl GenTxId {
    /// The underlying 32-byte hash.
    pub fn hash(&self) -> &Hash256 {
        match self {
            GenTxId::Txid(hash) | GenTxId::Wtxid(hash) => hash,
        }
    }

    pub fn is_wtxid(&self) -> bool {
        matches!(self, GenTxId::Wtxid(_))
    }
}
