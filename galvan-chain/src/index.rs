//! Header-tree arena.
//!
//! Every known header lives in one arena slot; relationships are
//! expressed through [`BlockIndexHandle`]s rather than references, so
//! the networking layer can hold handles without borrowing into the
//! chain's state.

use std::collections::HashMap;

use galvan_core::{BlockHeader, Hash256, ZERO_HASH};

use crate::Work;

/// Opaque index of a header-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndexHandle(usize);

impl BlockIndexHandle {
    /// The raw slot index (display / diagnostics only).
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// A node of the header tree.
#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    /// Cumulative work from genesis through this header.
    pub chainwork: Work,
    pub parent: Option<BlockIndexHandle>,
    /// Whether the full block is stored and available to serve.
    pub have_data: bool,
    /// Whether this block or an ancestor failed validation.
    pub failed: bool,
}

/// A block locator: hashes at exponentially increasing depth from a
/// starting point, ending near genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub hashes: Vec<Hash256>,
}

impl BlockLocator {
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }
}

/// Errors inserting a header into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("previous block not known")]
    UnknownParent,
    #[error("header does not connect to genesis")]
    NotGenesis,
}

/// Arena of all known block headers, plus the active chain.
#[derive(Debug, Default)]
pub struct BlockIndexArena {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockIndexHandle>,
    /// Active chain handles, indexed by height.
    active: Vec<BlockIndexHandle>,
}

impl BlockIndexArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena seeded with a genesis header as the active tip.
    pub fn with_genesis(genesis: BlockHeader) -> (Self, BlockIndexHandle) {
        let mut arena = Self::new();
        let handle = arena
            .insert(genesis)
            .expect("genesis header always inserts");
        arena.set_tip(handle);
        (arena, handle)
    }

    /// Number of headers in the arena.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a header, connecting it to its parent. Re-inserting a
    /// known header returns the existing handle.
    pub fn insert(&mut self, header: BlockHeader) -> Result<BlockIndexHandle, InsertError> {
        let hash = header.hash();
        if let Some(&existing) = self.by_hash.get(&hash) {
            return Ok(existing);
        }

        let (parent, height, parent_work) = if header.prev_blockhash == ZERO_HASH
            && self.entries.is_empty()
        {
            (None, 0, Work::zero())
        } else {
            let parent = *self
                .by_hash
                .get(&header.prev_blockhash)
                .ok_or(InsertError::UnknownParent)?;
            let entry = &self.entries[parent.0];
            (Some(parent), entry.height + 1, entry.chainwork)
        };

        let handle = BlockIndexHandle(self.entries.len());
        self.entries.push(BlockIndexEntry {
            chainwork: parent_work + header.work(),
            hash,
            height,
            parent,
            have_data: false,
            failed: false,
            header,
        });
        self.by_hash.insert(hash, handle);
        Ok(handle)
    }

    /// Access an entry. Handles originate from this arena, so the slot
    /// always exists.
    pub fn get(&self, handle: BlockIndexHandle) -> &BlockIndexEntry {
        &self.entries[handle.0]
    }

    /// Look a header up by hash.
    pub fn lookup(&self, hash: &Hash256) -> Option<BlockIndexHandle> {
        self.by_hash.get(hash).copied()
    }

    /// Mark a block's data as stored.
    pub fn mark_have_data(&mut self, handle: BlockIndexHandle) {
        self.entries[handle.0].have_data = true;
    }

    /// Mark a block invalid.
    pub fn mark_failed(&mut self, handle: BlockIndexHandle) {
        self.entries[handle.0].failed = true;
    }

    /// The active tip, if a chain has been selected.
    pub fn tip(&self) -> Option<BlockIndexHandle> {
        self.active.last().copied()
    }

    /// Handle at `height` on the active chain.
    pub fn active_at(&self, height: u32) -> Option<BlockIndexHandle> {
        self.active.get(height as usize).copied()
    }

    /// Whether `handle` lies on the active chain.
    pub fn in_active_chain(&self, handle: BlockIndexHandle) -> bool {
        let height = self.entries[handle.0].height;
        self.active_at(height) == Some(handle)
    }

    /// Make the chain ending in `tip` active.
    pub fn set_tip(&mut self, tip: BlockIndexHandle) {
        let height = self.entries[tip.0].height as usize;
        self.active.clear();
        self.active.resize(height + 1, tip);
        let mut cursor = tip;
        loop {
            let entry = &self.entries[cursor.0];
            self.active[entry.height as usize] = cursor;
            match entry.parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
    }

    /// Ancestor of `handle` at `height` (or `handle` itself).
    pub fn ancestor(
        &self,
        handle: BlockIndexHandle,
        height: u32,
    ) -> Option<BlockIndexHandle> {
        let mut cursor = handle;
        loop {
            let entry = &self.entries[cursor.0];
            if entry.height == height {
                return Some(cursor);
            }
            if entry.height < height {
                return None;
            }
            cursor = entry.parent?;
        }
    }

    /// Deepest common ancestor of two handles.
    pub fn last_common_ancestor(
        &self,
        a: BlockIndexHandle,
        b: BlockIndexHandle,
    ) -> BlockIndexHandle {
        let min_height = self.entries[a.0].height.min(self.entries[b.0].height);
        let mut a = self.ancestor(a, min_height).expect("height exists");
        let mut b = self.ancestor(b, min_height).expect("height exists");
        while a != b {
            let pa = self.entries[a.0].parent;
            let pb = self.entries[b.0].parent;
            match (pa, pb) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                // Distinct roots can only happen with multiple genesis
                // candidates, which insert() forbids.
                _ => break,
            }
        }
        a
    }

    /// Build a locator starting at `from` (or the active tip).
    pub fn locator(&self, from: Option<BlockIndexHandle>) -> BlockLocator {
        let mut hashes = Vec::with_capacity(32);
        let Some(start) = from.or_else(|| self.tip()) else {
            return BlockLocator { hashes };
        };

        let mut step = 1u32;
        let mut cursor = Some(start);
        while let Some(handle) = cursor {
            let entry = &self.entries[handle.0];
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            // Exponential spacing once the locator has ten entries.
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let next_height = entry.height.saturating_sub(step);
            cursor = self.ancestor(handle, next_height);
        }
        BlockLocator { hashes }
    }

    /// Handle with the most cumulative work, side chains included.
    pub fn best_header(&self) -> Option<BlockIndexHandle> {
        (0..self.entries.len())
            .map(BlockIndexHandle)
            .max_by_key(|handle| self.entries[handle.0].chainwork)
    }

    /// First locator entry on the active chain, the caller's view of
    /// our common history.
    pub fn find_fork(&self, locator: &BlockLocator) -> Option<BlockIndexHandle> {
        for hash in &locator.hashes {
            if let Some(handle) = self.lookup(hash) {
                if self.in_active_chain(handle) {
                    return Some(handle);
                }
                // A known hash off the active chain still anchors the
                // caller; use its fork point with our tip.
                if let Some(tip) = self.tip() {
                    return Some(self.last_common_ancestor(handle, tip));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn child_of(parent: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            prev_blockhash: parent.hash(),
            nonce,
            time: parent.time + 600,
            ..*parent
        }
    }

    fn build_chain(arena: &mut BlockIndexArena, length: usize) -> Vec<BlockIndexHandle> {
        let mut headers = vec![genesis()];
        for i in 0..length {
            let next = child_of(headers.last().unwrap(), i as u32);
            headers.push(next);
        }
        headers
            .into_iter()
            .map(|h| arena.insert(h).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let (mut arena, root) = BlockIndexArena::with_genesis(genesis());
        let child = child_of(&genesis(), 7);
        let handle = arena.insert(child).unwrap();

        assert_eq!(arena.get(handle).height, 1);
        assert_eq!(arena.get(handle).parent, Some(root));
        assert_eq!(arena.lookup(&child.hash()), Some(handle));
        // Re-insert returns the same handle.
        assert_eq!(arena.insert(child).unwrap(), handle);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut arena = BlockIndexArena::new();
        arena.insert(genesis()).unwrap();
        let mut orphan = genesis();
        orphan.prev_blockhash = [0xau8; 32];
        assert_eq!(arena.insert(orphan), Err(InsertError::UnknownParent));
    }

    #[test]
    fn test_chainwork_accumulates() {
        let mut arena = BlockIndexArena::new();
        let handles = build_chain(&mut arena, 3);
        let per_block = genesis().work();
        assert_eq!(arena.get(handles[3]).chainwork, per_block * 4u64);
    }

    #[test]
    fn test_active_chain_and_ancestor() {
        let mut arena = BlockIndexArena::new();
        let handles = build_chain(&mut arena, 10);
        arena.set_tip(handles[10]);

        assert_eq!(arena.tip(), Some(handles[10]));
        assert_eq!(arena.active_at(4), Some(handles[4]));
        assert!(arena.in_active_chain(handles[7]));
        assert_eq!(arena.ancestor(handles[10], 3), Some(handles[3]));
        assert_eq!(arena.ancestor(handles[3], 10), None);
    }

    #[test]
    fn test_last_common_ancestor_of_fork() {
        let mut arena = BlockIndexArena::new();
        let handles = build_chain(&mut arena, 5);

        // Fork off at height 3.
        let fork_parent = arena.get(handles[3]).header;
        let fork_a = arena.insert(child_of(&fork_parent, 1000)).unwrap();
        let fork_b = arena
            .insert(child_of(&arena.get(fork_a).header.clone(), 1001))
            .unwrap();

        assert_eq!(arena.last_common_ancestor(fork_b, handles[5]), handles[3]);
        assert_eq!(arena.last_common_ancestor(handles[5], handles[5]), handles[5]);
    }

    #[test]
    fn test_locator_spacing() {
        let mut arena = BlockIndexArena::new();
        let handles = build_chain(&mut arena, 100);
        arena.set_tip(handles[100]);

        let locator = arena.locator(None);
        // Dense near the tip, sparse far away, genesis last.
        assert_eq!(locator.hashes[0], arena.get(handles[100]).hash);
        assert_eq!(locator.hashes[1], arena.get(handles[99]).hash);
        assert_eq!(*locator.hashes.last().unwrap(), arena.get(handles[0]).hash);
        assert!(locator.len() < 30);
    }

    #[test]
    fn test_find_fork() {
        let mut arena = BlockIndexArena::new();
        let handles = build_chain(&mut arena, 20);
        arena.set_tip(handles[20]);

        let locator = BlockLocator {
            hashes: vec![[0xffu8; 32], arena.get(handles[12]).hash],
        };
        assert_eq!(arena.find_fork(&locator), Some(handles[12]));

        let empty = BlockLocator::default();
        assert_eq!(arena.find_fork(&empty), None);
    }
}
