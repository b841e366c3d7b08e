//! Core primitives for the Galvan node.
//!
//! This crate holds everything the networking and chain layers agree on
//! at the byte level:
//!
//! - Wire serialization (little-endian integers, compact sizes, var strings)
//! - Hashing (SHA-256d, SipHash-2-4, ChaCha20)
//! - Block header and transaction types with consensus encoding
//! - BIP 158 Golomb-coded set block filters
//!
//! Nothing here performs I/O or holds network state.

pub mod block;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod serialization;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use error::DecodeError;
pub use filter::{BlockFilter, GcsFilter, GcsFilterParams};
pub use serialization::{Decoder, Encoder};
pub use transaction::{GenTxId, OutPoint, Transaction, TxIn, TxOut};

/// A 32-byte hash, stored in the byte order it travels on the wire.
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as a terminator in locators and header chains.
pub const ZERO_HASH: Hash256 = [0u8; 32];
