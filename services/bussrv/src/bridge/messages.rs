//! Bridge wire payloads
//!
//! Serde structs for everything the bridge publishes or consumes. All
//! timestamps are UTC RFC 3339.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use domus_knx::{DptValue, GroupAddress};
use domus_registry::{AddressBinding, Device, StateDiff};

/// Retained device state publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub device_id: String,
    /// Function name within the device (e.g. "switch", "brightness")
    pub function: String,
    pub address: GroupAddress,
    pub value: DptValue,
    pub timestamp: DateTime<Utc>,
}

impl StateMessage {
    pub fn from_diff(diff: &StateDiff, address: GroupAddress) -> Self {
        Self {
            device_id: diff.device_id.clone(),
            function: diff.function.clone(),
            address,
            value: diff.value.clone(),
            timestamp: diff.timestamp,
        }
    }
}

/// Inbound command
///
/// `device_id` may be omitted in the payload; the command topic carries
/// it and wins on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(default = "new_command_id")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub device_id: String,
    /// Function name to write (must match a device address binding)
    pub command: String,
    pub value: DptValue,
    /// Free-form originator tag for audit logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}

/// Command acknowledgement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Failed,
}

/// Machine-readable ack error codes
pub mod ack_codes {
    pub const DEVICE_UNREACHABLE: &str = "DEVICE_UNREACHABLE";
    pub const INVALID_COMMAND: &str = "INVALID_COMMAND";
    pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const NOT_CONFIGURED: &str = "NOT_CONFIGURED";
    pub const BRIDGE_ERROR: &str = "BRIDGE_ERROR";
}

/// Immediate command acknowledgement
///
/// Acceptance means the command passed validation and was handed to the
/// transport; it says nothing about the device's eventual reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    /// Id of the command being acknowledged
    pub id: String,
    pub device_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AckMessage {
    pub fn accepted(command: &CommandMessage) -> Self {
        Self {
            id: command.id.clone(),
            device_id: command.device_id.clone(),
            status: AckStatus::Accepted,
            error_code: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(command: &CommandMessage, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: command.id.clone(),
            device_id: command.device_id.clone(),
            status: AckStatus::Failed,
            error_code: Some(code.to_string()),
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Bridge connection summary inside the health heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub bus_connected: bool,
    pub daemon_state: String,
}

/// Traffic counters inside the health heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficInfo {
    pub telegrams_sent: u64,
    pub telegrams_received: u64,
    pub frame_errors: u64,
    pub reconnects: u64,
}

/// Retained health heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMessage {
    pub bridge: String,
    /// "online" while the heartbeat loop runs; the broker publishes the
    /// retained "offline" last-will when the session dies
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connection: ConnectionInfo,
    pub statistics: TrafficInfo,
    pub devices_managed: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthMessage {
    /// Last-will payload registered at connect time
    pub fn offline_payload() -> Vec<u8> {
        serde_json::json!({
            "bridge": "bussrv",
            "status": "offline",
        })
        .to_string()
        .into_bytes()
    }
}

/// Retained device discovery publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub device_id: String,
    pub name: String,
    pub protocol: String,
    pub addresses: HashMap<String, AddressBinding>,
    pub capabilities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DiscoveryMessage {
    pub fn from_device(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            name: device.name.clone(),
            protocol: super::topics::PROTOCOL.to_string(),
            addresses: device.addresses.clone(),
            capabilities: device.capabilities.clone(),
            timestamp: Utc::now(),
        }
    }
}
