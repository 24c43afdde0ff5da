//! Codec error types.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors produced while encoding or decoding versioned payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input shorter than the fixed envelope header.
    #[error("envelope too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Magic number does not identify a plansync envelope.
    #[error("invalid magic: got {0:#010x}")]
    InvalidMagic(u32),

    /// Envelope written by a newer or no longer supported format version.
    #[error("unsupported format version {version} (supported {min}..={max})")]
    UnsupportedVersion {
        /// Version found in the envelope
        version: u16,
        /// Oldest version this build reads
        min: u16,
        /// Current version
        max: u16,
    },

    /// Envelope carries a different payload kind than the caller expected.
    #[error("payload kind mismatch: expected {expected:#06x}, got {actual:#06x}")]
    KindMismatch {
        /// Kind the caller asked for
        expected: u16,
        /// Kind found in the envelope
        actual: u16,
    },

    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Deflate compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),
}
