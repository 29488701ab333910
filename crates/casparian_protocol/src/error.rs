//! Error types for the wire protocol codec.

use thiserror::Error;

/// Protocol operation result type.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while packing or unpacking protocol frames.
///
/// Per spec, any of these is fatal to the connection; none are retried at
/// the message level.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("expected {expected} frames, got {got}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("payload length mismatch: header declared {expected} bytes, got {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("payload too large: {size} bytes exceeds max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("malformed payload JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
