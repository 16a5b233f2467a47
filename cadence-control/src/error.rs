//! Error types for control operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Could not encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Refused before the body was read
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("Incompatible protocol version: peer={peer}, local={local}")]
    VersionMismatch { peer: u32, local: u32 },

    /// The request is well formed but must not be acted on
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The scheduler failed to carry out the command, or the server
    /// answered with an error
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid socket path: {0}")]
    InvalidSocketPath(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
