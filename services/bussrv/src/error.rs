//! Error handling for the bus service
//!
//! A single string-payload error enum keeps fault categories aligned
//! with how faults are recovered: daemon, transport and bridge errors
//! surface as health-status changes, everything else is handled at the
//! call site.

use thiserror::Error;

/// Bus service error type
#[derive(Error, Debug, Clone)]
pub enum BusSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Bus protocol errors (codec, framing)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Daemon connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Data handling errors (serialization, parsing, conversion)
    #[error("Data error: {0}")]
    DataError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// External daemon process faults
    #[error("Daemon error: {0}")]
    DaemonError(String),

    /// Outbound bridge (MQTT) errors
    #[error("Bridge error: {0}")]
    BridgeError(String),

    /// Realtime hub (websocket) errors
    #[error("Hub error: {0}")]
    HubError(String),

    /// Device errors (unknown device, unknown function)
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Validation errors (invalid parameter, unsupported operation)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// State and synchronization errors
    #[error("State error: {0}")]
    StateError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the bus service
pub type Result<T> = std::result::Result<T, BusSrvError>;

impl BusSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        BusSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        BusSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BusSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        BusSrvError::ConnectionError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        BusSrvError::DataError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BusSrvError::TimeoutError(msg.into())
    }

    pub fn daemon(msg: impl Into<String>) -> Self {
        BusSrvError::DaemonError(msg.into())
    }

    pub fn bridge(msg: impl Into<String>) -> Self {
        BusSrvError::BridgeError(msg.into())
    }

    pub fn hub(msg: impl Into<String>) -> Self {
        BusSrvError::HubError(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        BusSrvError::DeviceError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BusSrvError::ValidationError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        BusSrvError::StateError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BusSrvError::InternalError(msg.into())
    }

    pub fn device_not_found(id: impl std::fmt::Display) -> Self {
        BusSrvError::DeviceError(format!("Device not found: {}", id))
    }

    pub fn not_connected() -> Self {
        BusSrvError::ConnectionError("Not connected".to_string())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for BusSrvError {
    fn from(err: std::io::Error) -> Self {
        BusSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BusSrvError {
    fn from(err: serde_json::Error) -> Self {
        BusSrvError::DataError(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for BusSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        BusSrvError::DataError(format!("YAML: {err}"))
    }
}

impl From<domus_knx::KnxError> for BusSrvError {
    fn from(err: domus_knx::KnxError) -> Self {
        match err {
            domus_knx::KnxError::OutOfRange(msg) => BusSrvError::ValidationError(msg),
            domus_knx::KnxError::InvalidAddress(msg) => BusSrvError::ValidationError(msg),
            other => BusSrvError::ProtocolError(other.to_string()),
        }
    }
}

impl From<domus_registry::RegistryError> for BusSrvError {
    fn from(err: domus_registry::RegistryError) -> Self {
        match err {
            domus_registry::RegistryError::UnknownDevice(id) => {
                BusSrvError::device_not_found(id)
            },
            domus_registry::RegistryError::UnknownAddress(msg) => BusSrvError::DeviceError(msg),
            domus_registry::RegistryError::Validation(msg) => BusSrvError::ValidationError(msg),
        }
    }
}

impl From<rumqttc::ClientError> for BusSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        BusSrvError::BridgeError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn daemon_error(self, msg: &str) -> Result<T>;
    fn bridge_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::IoError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::ProtocolError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn daemon_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::DaemonError(format!("{msg}: {e}")))
    }

    fn bridge_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::BridgeError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| BusSrvError::InternalError(format!("{msg}: {e}")))
    }
}
