//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors.
///
/// Every variant is structural: the peer sent something that cannot be a
/// valid packet and the physical connection is expected to be dropped.
/// Partial input is not an error; decoders return `Ok(None)` for it.
#[derive(Error, Debug)]
pub enum WireError {
    /// Unknown outer packet type
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// Unknown inner message type
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Length header could not be parsed
    #[error("invalid length header")]
    InvalidLength,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// A declared attachment placeholder was not found in the data source
    #[error("attachment placeholder {0} not found in packet source")]
    MissingPlaceholder(usize),

    /// Decoded arguments did not match the registered argument types
    #[error("argument {index} does not match expected {expected}")]
    ArgMismatch {
        /// Position of the offending argument
        index: usize,
        /// Name of the expected kind
        expected: &'static str,
    },

    /// JSON body could not be parsed or produced
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Attachment text was not valid base64
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

