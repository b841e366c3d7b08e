//! SHA-256 hashing utilities.

use sha2::{Digest, Sha256};

use crate::Hash256;

/// Compute SHA-256 of the input data.
#[inline]
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute double SHA-256 of the input data.
#[inline]
pub fn sha256d(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// Double SHA-256 over the concatenation of two 32-byte values.
///
/// Used for filter header chains, which hash `left ‖ right` without
/// an intermediate allocation.
pub fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let first: Hash256 = hasher.finalize().into();
    sha256(&first)
}

/// First four bytes of the double SHA-256 of the payload.
///
/// This is the frame checksum of the wire protocol.
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}
