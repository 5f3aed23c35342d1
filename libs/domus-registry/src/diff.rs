//! State diff events
//!
//! A diff is emitted if and only if a stored value actually changed;
//! re-applying an identical value produces nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use domus_knx::DptValue;

use crate::device::DeviceHealth;

/// Where a state mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOrigin {
    /// Observed on the bus (group write or response)
    Bus,
    /// Write-through of an accepted command
    Command,
    /// Initial seeding
    Seed,
}

/// A single confirmed state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub device_id: String,
    /// Function name the changed binding is keyed by
    pub function: String,
    pub previous: Option<DptValue>,
    pub value: DptValue,
    pub origin: DiffOrigin,
    pub timestamp: DateTime<Utc>,
}

/// Event fanned out to registry subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    StateChanged(StateDiff),
    HealthChanged {
        device_id: String,
        previous: DeviceHealth,
        health: DeviceHealth,
        timestamp: DateTime<Utc>,
    },
}

impl RegistryEvent {
    pub fn device_id(&self) -> &str {
        match self {
            RegistryEvent::StateChanged(diff) => &diff.device_id,
            RegistryEvent::HealthChanged { device_id, .. } => device_id,
        }
    }
}
