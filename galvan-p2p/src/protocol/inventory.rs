//! Inventory vectors.

use galvan_core::{DecodeError, Decoder, Encoder, GenTxId, Hash256};

/// Inventory item types.
///
/// The witness flag (bit 30) folds into the block and tx types on the
/// wire; `WTx` is the BIP 339 announcement type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
    CmpctBlock,
    WTx,
    WitnessTx,
    WitnessBlock,
}

const MSG_WITNESS_FLAG: u32 = 1 << 30;

impl InvType {
    /// Wire value.
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CmpctBlock => 4,
            InvType::WTx => 5,
            InvType::WitnessTx => 1 | MSG_WITNESS_FLAG,
            InvType::WitnessBlock => 2 | MSG_WITNESS_FLAG,
        }
    }

    /// Parse a wire value. Unknown types are a decode error; the
    /// caller decides whether that is punishable.
    pub fn from_u32(value: u32) -> Result<Self, DecodeError> {
        Ok(match value {
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CmpctBlock,
            5 => InvType::WTx,
            v if v == 1 | MSG_WITNESS_FLAG => InvType::WitnessTx,
            v if v == 2 | MSG_WITNESS_FLAG => InvType::WitnessBlock,
            _ => return Err(DecodeError::InvalidValue("inventory type")),
        })
    }

    /// Whether this announces a transaction.
    pub fn is_tx(self) -> bool {
        matches!(self, InvType::Tx | InvType::WTx | InvType::WitnessTx)
    }

    /// Whether this announces a block (in any form).
    pub fn is_block(self) -> bool {
        matches!(
            self,
            InvType::Block | InvType::FilteredBlock | InvType::CmpctBlock | InvType::WitnessBlock
        )
    }
}

/// One inventory entry: a typed hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn new(inv_type: InvType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }

    /// Tx announcements map to a generic txid; blocks have none.
    pub fn to_gen_txid(&self) -> Option<GenTxId> {
        match self.inv_type {
            InvType::Tx | InvType::WitnessTx => Some(GenTxId::Txid(self.hash)),
            InvType::WTx => Some(GenTxId::Wtxid(self.hash)),
            _ => None,
        }
    }

    pub fn consensus_encode(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.inv_type.to_u32());
        enc.write_bytes(&self.hash);
    }

    pub fn consensus_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let inv_type = InvType::from_u32(dec.read_u32_le()?)?;
        let hash = dec.read_fixed()?;
        Ok(Self { inv_type, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(InvType::Tx.to_u32(), 1);
        assert_eq!(InvType::Block.to_u32(), 2);
        assert_eq!(InvType::WTx.to_u32(), 5);
        assert_eq!(InvType::WitnessTx.to_u32(), 0x40000001);
        assert_eq!(InvType::WitnessBlock.to_u32(), 0x40000002);
    }

    #[test]
    fn test_roundtrip() {
        for inv_type in [
            InvType::Tx,
            InvType::Block,
            InvType::FilteredBlock,
            InvType::CmpctBlock,
            InvType::WTx,
            InvType::WitnessTx,
            InvType::WitnessBlock,
        ] {
            let item = InvItem::new(inv_type, [3u8; 32]);
            let mut enc = Encoder::new();
            item.consensus_encode(&mut enc);
            let bytes = enc.into_inner();
            assert_eq!(bytes.len(), 36);
            let mut dec = Decoder::new(&bytes);
            assert_eq!(InvItem::consensus_decode(&mut dec).unwrap(), item);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut enc = Encoder::new();
        enc.write_u32_le(99);
        enc.write_bytes(&[0u8; 32]);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        assert!(InvItem::consensus_decode(&mut dec).is_err());
    }

    #[test]
    fn test_gen_txid_mapping() {
        let hash = [7u8; 32];
        assert_eq!(
            InvItem::new(InvType::Tx, hash).to_gen_txid(),
            Some(GenTxId::Txid(hash))
        );
        assert_eq!(
            InvItem::new(InvType::WTx, hash).to_gen_txid(),
            Some(GenTxId::Wtxid(hash))
        );
        assert_eq!(InvItem::new(InvType::Block, hash).to_gen_txid(), None);
    }
}
