//! Chain-side collaborators of the Galvan networking engine.
//!
//! The networking crate never owns consensus state. It talks to the
//! chain through the [`ChainManager`] trait, addressing header-tree
//! nodes by opaque [`BlockIndexHandle`]s into an arena the chain owns.
//! This crate provides:
//!
//! - The header-tree arena ([`BlockIndexArena`]) with chainwork,
//!   ancestor walks, locators and fork lookup
//! - The [`ChainManager`] / [`Mempool`] collaborator traits and the
//!   validation result taxonomy
//! - An in-memory [`InMemoryChain`] implementation used by tests and
//!   light integrations

pub mod index;
pub mod interface;
pub mod memory;
pub mod params;

pub use index::{BlockIndexArena, BlockIndexEntry, BlockIndexHandle, BlockLocator};
pub use interface::{
    BlockIndexInfo, BlockProcessResult, BlockValidationResult, ChainManager, Mempool,
    MempoolAcceptResult, TxMempoolInfo, TxRejectReason,
};
pub use memory::InMemoryChain;
pub use params::ChainParams;

/// Accumulated proof-of-work, a 256-bit integer.
pub type Work = primitive_types::U256;
