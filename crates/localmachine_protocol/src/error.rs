//! Error types for protocol encoding and packed files.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or packing protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The checksum line of a packed file does not match its body.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Checksum declared in the file.
        expected: String,
        /// Checksum of the received body.
        actual: String,
    },

    /// The packed file has no valid checksum header.
    #[error("malformed packed file: {0}")]
    MalformedFile(String),

    /// A length-prefixed record runs past the end of the body.
    #[error("truncated record at byte {offset}: need {needed} bytes, {available} available")]
    Truncated {
        /// Offset of the record in the body.
        offset: usize,
        /// Bytes the record claims.
        needed: usize,
        /// Bytes left in the body.
        available: usize,
    },

    /// The event does not fit into the current non-empty block.
    #[error("event of {event_len} bytes does not fit, {remaining} bytes left in block")]
    CapacityExceeded {
        /// Encoded size of the rejected event.
        event_len: usize,
        /// Capacity left in the block.
        remaining: i64,
    },

    /// A packed file name does not carry the expected suffix.
    #[error("file {name} does not end with {expected}")]
    InvalidSuffix {
        /// Offending file name.
        name: String,
        /// Required suffix.
        expected: &'static str,
    },

    /// A zip archive could not be read or written.
    #[error("archive error: {0}")]
    Archive(String),

    /// A business version string could not be parsed.
    #[error("invalid business version: {0}")]
    InvalidVersion(String),
}
