//! P2P error types.

use std::io;

use galvan_core::DecodeError;
use thiserror::Error;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error surfaced through the framing codec.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to decode a payload or frame field.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Frame declares a payload above the protocol maximum.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame carries the wrong network magic.
    #[error("invalid network magic: expected {expected:02x?}, got {actual:02x?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Frame checksum does not match the payload.
    #[error("invalid checksum for command {command}")]
    InvalidChecksum { command: String },

    /// Frame command field is not zero-padded printable ASCII.
    #[error("malformed command field")]
    MalformedCommand,

    /// Operation referenced a peer that is not connected.
    #[error("peer not found: {0}")]
    PeerNotFound(u64),

    /// A block was requested from a peer that cannot serve it.
    #[error("peer cannot serve the requested block")]
    CannotServeBlock,

    /// The block is already being downloaded.
    #[error("block already requested")]
    AlreadyRequested,

    /// Persisted address-manager data has an incompatible version.
    #[error("incompatible address manager format version {0}")]
    InvalidAddrManVersion(u8),

    /// Persisted address-manager data failed its checksum.
    #[error("address manager data corrupted")]
    AddrManCorrupted,
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
