//! Cryptographic primitives.
//!
//! SHA-256 comes from the `sha2` crate; SipHash-2-4 and ChaCha20 are
//! implemented here because the keyed and seekable variants the
//! protocol needs are not exposed by the standard library.

pub mod chacha20;
pub mod hashing;
pub mod siphash;

pub use chacha20::ChaCha20;
pub use hashing::{sha256, sha256d, sha256d_pair};
pub use siphash::{siphash, siphash_u256_extra, SipHasher24};
