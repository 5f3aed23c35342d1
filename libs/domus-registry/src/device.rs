//! Device model
//!
//! A device is a named collection of group-address bindings, one per
//! logical function (`"switch"`, `"brightness"`, `"temperature"`, ...),
//! plus its last known state and a health status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use domus_knx::{Dpt, DptValue, GroupAddress};

// ============================================================================
// Bindings
// ============================================================================

/// Communication flags for a single binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingFlags {
    /// Value may be read from the bus (read request allowed)
    pub read: bool,
    /// Value may be written to the bus
    pub write: bool,
    /// Device transmits value changes on its own
    pub transmit: bool,
}

impl Default for BindingFlags {
    fn default() -> Self {
        // Most group objects are fully communicating unless configured
        // otherwise
        Self {
            read: true,
            write: true,
            transmit: true,
        }
    }
}

/// One group-address binding of a device function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressBinding {
    pub group_address: GroupAddress,
    pub dpt: Dpt,
    #[serde(default)]
    pub flags: BindingFlags,
}

// ============================================================================
// Health
// ============================================================================

/// Device health state machine
///
/// ```text
/// Unknown --activity--> Online --stale timeout--> Stale
///   Stale --activity--> Online
///   Stale --offline timeout--> Offline --activity--> Online
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    /// Never heard from since startup
    Unknown,
    /// Recent bus activity observed
    Online,
    /// No activity within the stale window
    Stale,
    /// No activity within the offline window
    Offline,
}

impl DeviceHealth {
    /// Transition on observed bus activity
    pub fn on_activity(self) -> Self {
        DeviceHealth::Online
    }

    /// Transition when the last activity is older than the stale window
    pub fn on_stale_timeout(self) -> Self {
        match self {
            DeviceHealth::Online => DeviceHealth::Stale,
            other => other,
        }
    }

    /// Transition when the last activity is older than the offline window
    pub fn on_offline_timeout(self) -> Self {
        match self {
            DeviceHealth::Online | DeviceHealth::Stale => DeviceHealth::Offline,
            other => other,
        }
    }
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceHealth::Unknown => "unknown",
            DeviceHealth::Online => "online",
            DeviceHealth::Stale => "stale",
            DeviceHealth::Offline => "offline",
        })
    }
}

// ============================================================================
// Device
// ============================================================================

/// Creation payload for a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Bindings keyed by function name
    pub addresses: HashMap<String, AddressBinding>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A managed device with its last known state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Bindings keyed by function name
    pub addresses: HashMap<String, AddressBinding>,
    pub capabilities: Vec<String>,
    /// Last known value per function
    pub state: HashMap<String, DptValue>,
    pub health: DeviceHealth,
    /// Payloads that failed to decode against this device's bindings
    pub decode_errors: u64,
    pub state_updated_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn from_seed(seed: DeviceSeed) -> Self {
        let name = if seed.name.is_empty() {
            seed.id.clone()
        } else {
            seed.name
        };
        Self {
            id: seed.id,
            name,
            addresses: seed.addresses,
            capabilities: seed.capabilities,
            state: HashMap::new(),
            health: DeviceHealth::Unknown,
            decode_errors: 0,
            state_updated_at: None,
            last_seen: None,
        }
    }

    /// Binding for a function, if configured
    pub fn binding(&self, function: &str) -> Option<&AddressBinding> {
        self.addresses.get(function)
    }

    /// Functions bound to the given group address
    pub fn functions_for(&self, ga: GroupAddress) -> Vec<(&str, &AddressBinding)> {
        self.addresses
            .iter()
            .filter(|(_, b)| b.group_address == ga)
            .map(|(f, b)| (f.as_str(), b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        assert_eq!(DeviceHealth::Unknown.on_activity(), DeviceHealth::Online);
        assert_eq!(DeviceHealth::Online.on_stale_timeout(), DeviceHealth::Stale);
        assert_eq!(DeviceHealth::Stale.on_activity(), DeviceHealth::Online);
        assert_eq!(
            DeviceHealth::Stale.on_offline_timeout(),
            DeviceHealth::Offline
        );
        assert_eq!(DeviceHealth::Offline.on_activity(), DeviceHealth::Online);
        // Unknown never decays further
        assert_eq!(
            DeviceHealth::Unknown.on_stale_timeout(),
            DeviceHealth::Unknown
        );
        assert_eq!(
            DeviceHealth::Unknown.on_offline_timeout(),
            DeviceHealth::Unknown
        );
    }

    #[test]
    fn test_from_seed_defaults_name_to_id() {
        let seed = DeviceSeed {
            id: "lamp-1".to_string(),
            name: String::new(),
            addresses: HashMap::new(),
            capabilities: vec![],
        };
        let device = Device::from_seed(seed);
        assert_eq!(device.name, "lamp-1");
        assert_eq!(device.health, DeviceHealth::Unknown);
    }
}
