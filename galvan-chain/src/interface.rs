//! Collaborator interfaces consumed by the networking engine.
//!
//! The engine reacts to validation *outcomes*; it never validates
//! anything itself. These traits are object-safe so tests can
//! substitute recording mocks.

use galvan_core::{Block, BlockHeader, GenTxId, Hash256, Transaction};

use crate::index::{BlockIndexHandle, BlockLocator};
use crate::Work;

/// Outcome classes for rejected blocks and headers.
///
/// The networking layer maps these onto misbehavior penalties; the
/// mapping lives there, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidationResult {
    /// The block violates consensus rules.
    Consensus,
    /// The block's transactions do not match its merkle commitment.
    Mutated,
    /// The parent header is unknown.
    MissingPrev,
    /// The parent block is known to be invalid.
    InvalidPrev,
    /// The header itself is malformed or fails its own PoW.
    InvalidHeader,
    /// The block conflicts with a checkpoint.
    Checkpoint,
    /// The block was already marked invalid.
    CachedInvalid,
    /// The header chain carries too little total work.
    HeaderLowWork,
}

/// Result of handing a complete block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockProcessResult {
    /// Newly accepted; the handle addresses the stored header.
    Accepted(BlockIndexHandle),
    /// The block was already known and stored.
    AlreadyHave(BlockIndexHandle),
    /// Rejected.
    Invalid(BlockValidationResult),
}

/// Why a transaction was refused mempool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRejectReason {
    AlreadyKnown,
    MissingInputs,
    Conflict,
    FeeTooLow,
    Consensus,
    Policy,
}

/// Result of submitting a transaction for mempool acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolAcceptResult {
    Accepted { txid: Hash256, wtxid: Hash256 },
    Rejected(TxRejectReason),
}

/// A copy of the data the engine reads from a header-tree node.
#[derive(Debug, Clone)]
pub struct BlockIndexInfo {
    pub hash: Hash256,
    pub height: u32,
    pub chainwork: Work,
    pub header: BlockHeader,
    pub parent: Option<BlockIndexHandle>,
    pub have_data: bool,
    pub failed: bool,
}

/// The chain collaborator.
///
/// Calls may block on validation; the engine holds no per-peer locks
/// while calling in.
pub trait ChainManager: Send + Sync {
    /// Validate and store a batch of connecting headers. Returns the
    /// handle of the last accepted header.
    fn process_new_block_headers(
        &self,
        headers: &[BlockHeader],
        min_pow_checked: bool,
    ) -> Result<BlockIndexHandle, BlockValidationResult>;

    /// Validate and store a complete block. `force_processing` marks
    /// blocks we explicitly requested.
    fn process_new_block(
        &self,
        block: &Block,
        force_processing: bool,
        min_pow_checked: bool,
    ) -> BlockProcessResult;

    /// Submit a transaction for mempool acceptance.
    fn process_transaction(&self, tx: &Transaction) -> MempoolAcceptResult;

    /// Tip of the active (most-work, fully validated) chain.
    fn active_tip(&self) -> Option<BlockIndexHandle>;

    /// Handle at `height` on the active chain.
    fn active_at_height(&self, height: u32) -> Option<BlockIndexHandle>;

    /// Best known header by work, regardless of block availability.
    fn best_header(&self) -> Option<BlockIndexHandle>;

    /// Look a header up by block hash.
    fn lookup_block_index(&self, hash: &Hash256) -> Option<BlockIndexHandle>;

    /// Locate the caller's last common active-chain block.
    fn find_fork_in_global_index(&self, locator: &BlockLocator) -> Option<BlockIndexHandle>;

    /// Read a header-tree node.
    fn block_info(&self, handle: BlockIndexHandle) -> BlockIndexInfo;

    /// Ancestor of `handle` at `height`.
    fn ancestor(&self, handle: BlockIndexHandle, height: u32) -> Option<BlockIndexHandle>;

    /// Deepest common ancestor of two handles.
    fn last_common_ancestor(
        &self,
        a: BlockIndexHandle,
        b: BlockIndexHandle,
    ) -> BlockIndexHandle;

    /// Whether `handle` lies on the active chain.
    fn in_active_chain(&self, handle: BlockIndexHandle) -> bool;

    /// Build a locator from `from` (or the active tip).
    fn get_locator(&self, from: Option<BlockIndexHandle>) -> BlockLocator;

    /// Fetch a stored block for serving.
    fn get_block(&self, handle: BlockIndexHandle) -> Option<Block>;

    /// Whether the node is still in initial block download.
    fn is_initial_block_download(&self) -> bool;

    /// Static anti-DoS floor for header chains.
    fn minimum_chain_work(&self) -> Work;

    /// Target block interval in seconds.
    fn pow_target_spacing(&self) -> u64;
}

/// Mempool entry metadata the engine serves and relays from.
#[derive(Debug, Clone)]
pub struct TxMempoolInfo {
    pub tx: Transaction,
    /// Fee in base units.
    pub fee: i64,
    /// Virtual size used for fee-rate comparisons.
    pub vsize: usize,
    /// Unix time the entry was accepted.
    pub time: i64,
}

impl TxMempoolInfo {
    /// Fee rate in base units per 1000 vbytes.
    pub fn fee_rate(&self) -> i64 {
        if self.vsize == 0 {
            return 0;
        }
        self.fee.saturating_mul(1000) / self.vsize as i64
    }
}

/// The mempool collaborator.
pub trait Mempool: Send + Sync {
    /// Whether the pool contains the transaction.
    fn exists(&self, gtxid: &GenTxId) -> bool;

    /// Entry metadata by txid or wtxid.
    fn info(&self, gtxid: &GenTxId) -> Option<TxMempoolInfo>;

    /// Fetch by txid.
    fn get(&self, txid: &Hash256) -> Option<Transaction>;

    /// All entries, for `mempool` message replies.
    fn info_all(&self) -> Vec<TxMempoolInfo>;

    /// Transactions we have not yet seen any peer announce back,
    /// as (txid, wtxid) pairs.
    fn unbroadcast(&self) -> Vec<(Hash256, Hash256)>;

    /// Drop a transaction from the unbroadcast set.
    fn remove_unbroadcast(&self, txid: &Hash256);

    /// Minimum fee rate for mempool entry (base units / kvB).
    fn min_fee_rate(&self) -> i64;

    /// Entry count.
    fn size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate() {
        let info = TxMempoolInfo {
            tx: Transaction {
                version: 2,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
            fee: 1000,
            vsize: 250,
            time: 0,
        };
        assert_eq!(info.fee_rate(), 4000);
    }

    #[test]
    fn test_fee_rate_zero_size() {
        let info = TxMempoolInfo {
            tx: Transaction {
                version: 2,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
            fee: 1000,
            vsize: 0,
            time: 0,
        };
        assert_eq!(info.fee_rate(), 0);
    }
}
