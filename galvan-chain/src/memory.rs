//! In-memory [`ChainManager`] implementation.
//!
//! Enough chain to drive the networking engine: headers connect into
//! the arena, blocks are stored verbatim, the most-work stored chain
//! becomes active. Script and consensus validation stay out of scope;
//! integrators with a real validator supply their own implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use galvan_core::{Block, BlockHeader, Hash256, Transaction};

use crate::index::{BlockIndexArena, BlockIndexHandle, BlockLocator};
use crate::interface::{
    BlockIndexInfo, BlockProcessResult, BlockValidationResult, ChainManager, MempoolAcceptResult,
};
use crate::params::ChainParams;
use crate::Work;

struct ChainInner {
    arena: BlockIndexArena,
    blocks: HashMap<Hash256, Block>,
}

/// A header-tree-plus-block-store chain with no script validation.
pub struct InMemoryChain {
    params: ChainParams,
    inner: Mutex<ChainInner>,
    ibd: AtomicBool,
}

impl InMemoryChain {
    /// Create a chain with the given genesis header already active.
    pub fn new(params: ChainParams, genesis: BlockHeader) -> Self {
        let (arena, _) = BlockIndexArena::with_genesis(genesis);
        Self {
            params,
            inner: Mutex::new(ChainInner {
                arena,
                blocks: HashMap::new(),
            }),
            ibd: AtomicBool::new(true),
        }
    }

    /// Flip the initial-block-download flag (tests drive this).
    pub fn set_initial_block_download(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::Relaxed);
    }

    /// Header count, including side chains.
    pub fn header_count(&self) -> usize {
        self.inner.lock().expect("chain lock").arena.len()
    }

    fn maybe_reorg(inner: &mut ChainInner, candidate: BlockIndexHandle) {
        let candidate_work = inner.arena.get(candidate).chainwork;
        let tip_work = inner
            .arena
            .tip()
            .map(|tip| inner.arena.get(tip).chainwork)
            .unwrap_or_else(Work::zero);
        if candidate_work > tip_work {
            inner.arena.set_tip(candidate);
        }
    }
}

impl ChainManager for InMemoryChain {
    fn process_new_block_headers(
        &self,
        headers: &[BlockHeader],
        _min_pow_checked: bool,
    ) -> Result<BlockIndexHandle, BlockValidationResult> {
        let mut inner = self.inner.lock().expect("chain lock");
        let mut last = None;
        for header in headers {
            if !header.check_pow() {
                return Err(BlockValidationResult::InvalidHeader);
            }
            let handle = inner
                .arena
                .insert(*header)
                .map_err(|_| BlockValidationResult::MissingPrev)?;
            if inner.arena.get(handle).failed {
                return Err(BlockValidationResult::CachedInvalid);
            }
            last = Some(handle);
        }
        last.ok_or(BlockValidationResult::MissingPrev)
    }

    fn process_new_block(
        &self,
        block: &Block,
        _force_processing: bool,
        _min_pow_checked: bool,
    ) -> BlockProcessResult {
        let mut inner = self.inner.lock().expect("chain lock");
        let hash = block.hash();
        if let Some(handle) = inner.arena.lookup(&hash) {
            if inner.arena.get(handle).have_data {
                return BlockProcessResult::AlreadyHave(handle);
            }
        }
        if !block.header.check_pow() {
            return BlockProcessResult::Invalid(BlockValidationResult::InvalidHeader);
        }
        let handle = match inner.arena.insert(block.header) {
            Ok(handle) => handle,
            Err(_) => return BlockProcessResult::Invalid(BlockValidationResult::MissingPrev),
        };
        if inner.arena.get(handle).failed {
            return BlockProcessResult::Invalid(BlockValidationResult::CachedInvalid);
        }
        inner.arena.mark_have_data(handle);
        inner.blocks.insert(hash, block.clone());
        Self::maybe_reorg(&mut inner, handle);
        tracing::debug!(height = inner.arena.get(handle).height, "stored block");
        BlockProcessResult::Accepted(handle)
    }

    fn process_transaction(&self, tx: &Transaction) -> MempoolAcceptResult {
        MempoolAcceptResult::Accepted {
            txid: tx.txid(),
            wtxid: tx.wtxid(),
        }
    }

    fn active_tip(&self) -> Option<BlockIndexHandle> {
        self.inner.lock().expect("chain lock").arena.tip()
    }

    fn active_at_height(&self, height: u32) -> Option<BlockIndexHandle> {
        self.inner.lock().expect("chain lock").arena.active_at(height)
    }

    fn best_header(&self) -> Option<BlockIndexHandle> {
        self.inner.lock().expect("chain lock").arena.best_header()
    }

    fn lookup_block_index(&self, hash: &Hash256) -> Option<BlockIndexHandle> {
        self.inner.lock().expect("chain lock").arena.lookup(hash)
    }

    fn find_fork_in_global_index(&self, locator: &BlockLocator) -> Option<BlockIndexHandle> {
        self.inner.lock().expect("chain lock").arena.find_fork(locator)
    }

    fn block_info(&self, handle: BlockIndexHandle) -> BlockIndexInfo {
        let inner = self.inner.lock().expect("chain lock");
        let entry = inner.arena.get(handle);
        BlockIndexInfo {
            hash: entry.hash,
            height: entry.height,
            chainwork: entry.chainwork,
            header: entry.header,
            parent: entry.parent,
            have_data: entry.have_data,
            failed: entry.failed,
        }
    }

    fn ancestor(&self, handle: BlockIndexHandle, height: u32) -> Option<BlockIndexHandle> {
        self.inner
            .lock()
            .expect("chain lock")
            .arena
            .ancestor(handle, height)
    }

    fn last_common_ancestor(
        &self,
        a: BlockIndexHandle,
        b: BlockIndexHandle,
    ) -> BlockIndexHandle {
        self.inner
            .lock()
            .expect("chain lock")
            .arena
            .last_common_ancestor(a, b)
    }

    fn in_active_chain(&self, handle: BlockIndexHandle) -> bool {
        self.inner
            .lock()
            .expect("chain lock")
            .arena
            .in_active_chain(handle)
    }

    fn get_locator(&self, from: Option<BlockIndexHandle>) -> BlockLocator {
        self.inner.lock().expect("chain lock").arena.locator(from)
    }

    fn get_block(&self, handle: BlockIndexHandle) -> Option<Block> {
        let inner = self.inner.lock().expect("chain lock");
        let hash = inner.arena.get(handle).hash;
        inner.blocks.get(&hash).cloned()
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::Relaxed)
    }

    fn minimum_chain_work(&self) -> Work {
        self.params.minimum_chain_work
    }

    fn pow_target_spacing(&self) -> u64 {
        self.params.pow_target_spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_core::ZERO_HASH;

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: ZERO_HASH,
            merkle_root: [0u8; 32],
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        }
    }

    fn block_on(parent: &BlockHeader, nonce: u32) -> Block {
        let mut header = BlockHeader {
            prev_blockhash: parent.hash(),
            nonce,
            time: parent.time + 600,
            ..*parent
        };
        while !header.check_pow() {
            header.nonce = header.nonce.wrapping_add(1);
        }
        Block {
            header,
            transactions: vec![],
        }
    }

    #[test]
    fn test_block_extends_active_chain() {
        let chain = InMemoryChain::new(ChainParams::regtest(), genesis());
        let block = block_on(&genesis(), 1);

        let result = chain.process_new_block(&block, true, true);
        assert!(matches!(result, BlockProcessResult::Accepted(_)));

        let tip = chain.active_tip().unwrap();
        assert_eq!(chain.block_info(tip).hash, block.hash());
        assert_eq!(chain.block_info(tip).height, 1);
        assert_eq!(chain.get_block(tip).unwrap(), block);
    }

    #[test]
    fn test_duplicate_block_already_have() {
        let chain = InMemoryChain::new(ChainParams::regtest(), genesis());
        let block = block_on(&genesis(), 1);
        chain.process_new_block(&block, true, true);
        assert!(matches!(
            chain.process_new_block(&block, true, true),
            BlockProcessResult::AlreadyHave(_)
        ));
    }

    #[test]
    fn test_headers_connect() {
        let chain = InMemoryChain::new(ChainParams::regtest(), genesis());
        let a = block_on(&genesis(), 1).header;
        let b = block_on(&a, 2).header;
        let last = chain.process_new_block_headers(&[a, b], true).unwrap();
        assert_eq!(chain.block_info(last).height, 2);
        assert_eq!(chain.header_count(), 3);
    }

    #[test]
    fn test_disconnected_headers_rejected() {
        let chain = InMemoryChain::new(ChainParams::regtest(), genesis());
        let mut orphan = genesis();
        orphan.prev_blockhash = [9u8; 32];
        assert_eq!(
            chain.process_new_block_headers(&[orphan], true),
            Err(BlockValidationResult::MissingPrev)
        );
    }
}
