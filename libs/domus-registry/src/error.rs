//! Registry error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No device registered under the given id
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// No binding registered for the given group address or function
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// Seed or mutation rejected by validation
    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    pub fn unknown_device(id: impl Into<String>) -> Self {
        RegistryError::UnknownDevice(id.into())
    }

    pub fn unknown_address(msg: impl Into<String>) -> Self {
        RegistryError::UnknownAddress(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RegistryError::Validation(msg.into())
    }
}
