//! Error types for the KNX codec

use thiserror::Error;

/// KNX codec error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KnxError {
    /// Payload length or content does not match the datapoint type
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Value outside the encodable range of the datapoint type
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Address level outside the protocol bounds, or unparseable
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Daemon wire frame malformed (bad size field, truncated header)
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Result type alias for the KNX codec
pub type Result<T> = std::result::Result<T, KnxError>;

impl KnxError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        KnxError::MalformedPayload(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        KnxError::OutOfRange(msg.into())
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        KnxError::InvalidAddress(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        KnxError::InvalidFrame(msg.into())
    }
}
