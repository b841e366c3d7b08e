//! Probabilistic peer-facing filters.

pub mod bloom;
pub mod merkle;
pub mod rolling;

pub use bloom::BloomFilter;
pub use merkle::PartialMerkleTree;
pub use rolling::SeenCache;
