//! Serialization error types.

use thiserror::Error;

/// Error raised while decoding wire data.
///
/// Decoding failures are expected in normal operation (peers send
/// arbitrary bytes), so handlers treat them as protocol violations
/// rather than bugs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended before the value was complete.
    #[error("unexpected end of data: need {needed} more bytes, have {available}")]
    UnexpectedEnd { needed: usize, available: usize },

    /// A compact-size integer was not minimally encoded.
    #[error("non-canonical compact size encoding")]
    NonCanonicalCompactSize,

    /// A length prefix exceeds the allowed maximum.
    #[error("declared size {size} exceeds maximum {max}")]
    OversizedLength { size: u64, max: u64 },

    /// A var string held bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// A field held a value the format does not permit.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    /// Decoding finished but input bytes remain.
    #[error("trailing data after decoded value")]
    TrailingData,
}
