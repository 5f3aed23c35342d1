//! Device registry
//!
//! Concurrent cache of device state with change detection. Lookup is
//! bidirectional through two independent maps (group address to device
//! functions, device id to device); entries never hold references into
//! each other, so either side can be mutated without touching the
//! other.
//!
//! Mutations to one device serialize on its map entry; reads and
//! mutations of unrelated devices proceed concurrently. Telegram
//! arrival order per device is preserved by the single transport reader
//! task that calls [`DeviceRegistry::apply_telegram`].

use std::collections::VecDeque;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use domus_knx::{DptValue, GroupAddress, Telegram};

use crate::device::{Device, DeviceHealth, DeviceSeed};
use crate::diff::{DiffOrigin, RegistryEvent, StateDiff};
use crate::error::{RegistryError, Result};

/// Registry tuning knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Broadcast channel capacity for diff events
    pub event_capacity: usize,
    /// Per-device state history ring depth (0 disables history)
    pub history_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            history_depth: 64,
        }
    }
}

/// Aggregate health counts for the service health report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub devices: usize,
    pub online: usize,
    pub stale: usize,
    pub offline: usize,
    pub unknown: usize,
}

/// Index entry: which device function listens on a group address
#[derive(Debug, Clone)]
struct AddressTarget {
    device_id: String,
    function: String,
}

/// Concurrent device state cache
pub struct DeviceRegistry {
    /// Device id -> device
    devices: DashMap<String, Device>,
    /// Group address -> listening device functions (one address may
    /// feed several devices)
    by_address: DashMap<GroupAddress, Vec<AddressTarget>>,
    /// Per-device bounded diff history
    history: DashMap<String, VecDeque<StateDiff>>,
    events: broadcast::Sender<RegistryEvent>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            devices: DashMap::new(),
            by_address: DashMap::new(),
            history: DashMap::new(),
            events,
            config,
        }
    }

    /// Subscribe to state and health change events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Register a device
    ///
    /// Idempotent: seeding an already known id is a no-op and returns
    /// `Ok(false)`.
    pub fn seed_device(&self, seed: DeviceSeed) -> Result<bool> {
        if seed.id.is_empty() {
            return Err(RegistryError::validation("device id must not be empty"));
        }
        if self.devices.contains_key(&seed.id) {
            debug!("Device {} already seeded, skipping", seed.id);
            return Ok(false);
        }

        let device = Device::from_seed(seed);
        for (function, binding) in &device.addresses {
            self.by_address
                .entry(binding.group_address)
                .or_default()
                .push(AddressTarget {
                    device_id: device.id.clone(),
                    function: function.clone(),
                });
        }
        debug!(
            "Seeded device {} with {} binding(s)",
            device.id,
            device.addresses.len()
        );
        self.devices.insert(device.id.clone(), device);
        Ok(true)
    }

    /// Remove a device and its address index entries
    pub fn remove_device(&self, id: &str) -> Result<()> {
        let (_, device) = self
            .devices
            .remove(id)
            .ok_or_else(|| RegistryError::unknown_device(id))?;
        for binding in device.addresses.values() {
            if let Some(mut targets) = self.by_address.get_mut(&binding.group_address) {
                targets.retain(|t| t.device_id != id);
            }
        }
        self.by_address.retain(|_, targets| !targets.is_empty());
        self.history.remove(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Telegram application
    // ------------------------------------------------------------------

    /// Apply a received bus telegram
    ///
    /// Decodes the payload against every binding listening on the
    /// destination address and stores the value. A [`StateDiff`] is
    /// produced per binding if and only if the stored value changed
    /// bit-for-bit; identical re-delivery yields nothing. Read requests
    /// carry no value and never produce a diff. Decode failures are
    /// counted against the device and skipped without failing the whole
    /// application.
    pub fn apply_telegram(&self, telegram: &Telegram) -> Vec<StateDiff> {
        if telegram.is_read() {
            return Vec::new();
        }

        let targets: Vec<AddressTarget> = match self.by_address.get(&telegram.destination) {
            Some(entry) => entry.clone(),
            None => {
                debug!(
                    "No binding for group address {}, ignoring telegram",
                    telegram.destination
                );
                return Vec::new();
            },
        };

        let mut diffs = Vec::new();
        for target in targets {
            let Some(mut device) = self.devices.get_mut(&target.device_id) else {
                // Index can briefly trail a concurrent removal
                continue;
            };

            let Some(binding) = device.addresses.get(&target.function) else {
                continue;
            };

            let value = match binding.dpt.decode(&telegram.payload) {
                Ok(value) => value,
                Err(e) => {
                    device.decode_errors += 1;
                    warn!(
                        "Device {} function {}: payload decode failed: {}",
                        target.device_id, target.function, e
                    );
                    continue;
                },
            };

            device.last_seen = Some(telegram.received_at);
            self.transition_health_locked(&mut device, DeviceHealth::on_activity);

            if let Some(diff) = Self::store_value(
                &mut device,
                &target.function,
                value,
                DiffOrigin::Bus,
            ) {
                self.record_diff(&diff);
                diffs.push(diff);
            }
        }
        diffs
    }

    /// Write a validated command result through to the cache
    ///
    /// Same dedup rule as the bus path: a diff comes back only when the
    /// stored value actually changed.
    pub fn set_device_state(
        &self,
        device_id: &str,
        function: &str,
        value: DptValue,
        origin: DiffOrigin,
    ) -> Result<Option<StateDiff>> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;

        if !device.addresses.contains_key(function) {
            return Err(RegistryError::unknown_address(format!(
                "device {} has no function '{}'",
                device_id, function
            )));
        }

        let diff = Self::store_value(&mut device, function, value, origin);
        drop(device);
        if let Some(ref diff) = diff {
            self.record_diff(diff);
        }
        Ok(diff)
    }

    /// Force a device health status (used by the service health loop)
    pub fn set_device_health(&self, device_id: &str, health: DeviceHealth) -> Result<()> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        self.transition_health_locked(&mut device, |_| health);
        Ok(())
    }

    /// Sweep devices whose last activity is older than the given windows
    ///
    /// Intended to run on the service health interval. Returns the
    /// number of devices whose health changed.
    pub fn sweep_health(
        &self,
        stale_after: std::time::Duration,
        offline_after: std::time::Duration,
    ) -> usize {
        let now = Utc::now();
        let stale_cutoff = now
            - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let offline_cutoff = now
            - ChronoDuration::from_std(offline_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(0));

        let mut changed = 0;
        for mut device in self.devices.iter_mut() {
            let Some(last_seen) = device.last_seen else {
                continue;
            };
            let before = device.health;
            if last_seen < offline_cutoff {
                self.transition_health_locked(&mut device, DeviceHealth::on_offline_timeout);
            } else if last_seen < stale_cutoff {
                self.transition_health_locked(&mut device, DeviceHealth::on_stale_timeout);
            }
            if device.health != before {
                changed += 1;
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Cloned snapshot of a device
    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|d| d.clone())
    }

    /// Cloned snapshots of all devices
    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device functions listening on a group address
    pub fn targets_for(&self, ga: GroupAddress) -> Vec<(String, String)> {
        self.by_address
            .get(&ga)
            .map(|targets| {
                targets
                    .iter()
                    .map(|t| (t.device_id.clone(), t.function.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct readable group addresses across all devices
    ///
    /// Used for the initial read-all after seeding.
    pub fn readable_addresses(&self) -> Vec<GroupAddress> {
        let mut addresses: Vec<GroupAddress> = self
            .devices
            .iter()
            .flat_map(|device| {
                device
                    .addresses
                    .values()
                    .filter(|b| b.flags.read)
                    .map(|b| b.group_address)
                    .collect::<Vec<_>>()
            })
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Bounded diff history of a device, oldest first
    pub fn history(&self, device_id: &str) -> Vec<StateDiff> {
        self.history
            .get(device_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for device in self.devices.iter() {
            stats.devices += 1;
            match device.health {
                DeviceHealth::Online => stats.online += 1,
                DeviceHealth::Stale => stats.stale += 1,
                DeviceHealth::Offline => stats.offline += 1,
                DeviceHealth::Unknown => stats.unknown += 1,
            }
        }
        stats
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Replace a stored value, returning a diff when it changed
    fn store_value(
        device: &mut Device,
        function: &str,
        value: DptValue,
        origin: DiffOrigin,
    ) -> Option<StateDiff> {
        let previous = device.state.get(function).cloned();
        if previous.as_ref() == Some(&value) {
            return None;
        }

        let now = Utc::now();
        device.state.insert(function.to_string(), value.clone());
        device.state_updated_at = Some(now);

        Some(StateDiff {
            device_id: device.id.clone(),
            function: function.to_string(),
            previous,
            value,
            origin,
            timestamp: now,
        })
    }

    /// Apply a health transition while the device entry is held,
    /// emitting an event on change
    fn transition_health_locked(
        &self,
        device: &mut Device,
        transition: impl FnOnce(DeviceHealth) -> DeviceHealth,
    ) {
        let previous = device.health;
        let next = transition(previous);
        if next != previous {
            device.health = next;
            debug!("Device {} health: {} -> {}", device.id, previous, next);
            let _ = self.events.send(RegistryEvent::HealthChanged {
                device_id: device.id.clone(),
                previous,
                health: next,
                timestamp: Utc::now(),
            });
        }
    }

    fn record_diff(&self, diff: &StateDiff) {
        if self.config.history_depth > 0 {
            let mut ring = self.history.entry(diff.device_id.clone()).or_default();
            if ring.len() >= self.config.history_depth {
                ring.pop_front();
            }
            ring.push_back(diff.clone());
        }
        // Receivers may lag or be absent; dropped events are the
        // subscriber's problem, the cache stays authoritative
        let _ = self.events.send(RegistryEvent::StateChanged(diff.clone()));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AddressBinding, BindingFlags};
    use domus_knx::Dpt;
    use std::collections::HashMap;
    use std::time::Duration;

    fn ga(main: u8, middle: u8, sub: u8) -> GroupAddress {
        GroupAddress::new(main, middle, sub).unwrap()
    }

    fn lamp_seed(id: &str, address: GroupAddress) -> DeviceSeed {
        let mut addresses = HashMap::new();
        addresses.insert(
            "switch".to_string(),
            AddressBinding {
                group_address: address,
                dpt: Dpt::Switch,
                flags: BindingFlags::default(),
            },
        );
        DeviceSeed {
            id: id.to_string(),
            name: format!("Lamp {}", id),
            addresses,
            capabilities: vec!["switch".to_string()],
        }
    }

    fn write_telegram(dest: GroupAddress, payload: Vec<u8>) -> Telegram {
        Telegram::write(dest, payload)
    }

    #[test]
    fn test_seed_is_idempotent() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        assert!(registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap());
        assert!(!registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap());
        assert_eq!(registry.device_count(), 1);
        // Re-seeding must not duplicate the address index either
        assert_eq!(registry.targets_for(ga(1, 2, 3)).len(), 1);
    }

    #[test]
    fn test_apply_telegram_emits_diff_once() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();

        let telegram = write_telegram(ga(1, 2, 3), vec![0x01]);
        let diffs = registry.apply_telegram(&telegram);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].device_id, "lamp-1");
        assert_eq!(diffs[0].function, "switch");
        assert_eq!(diffs[0].previous, None);
        assert_eq!(diffs[0].value, DptValue::Bool(true));

        // Identical re-delivery: no diff
        let diffs = registry.apply_telegram(&telegram);
        assert!(diffs.is_empty());

        // Actual change: one diff with the previous value
        let telegram = write_telegram(ga(1, 2, 3), vec![0x00]);
        let diffs = registry.apply_telegram(&telegram);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].previous, Some(DptValue::Bool(true)));
        assert_eq!(diffs[0].value, DptValue::Bool(false));
    }

    #[test]
    fn test_read_telegram_produces_no_diff() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        let diffs = registry.apply_telegram(&Telegram::read(ga(1, 2, 3)));
        assert!(diffs.is_empty());
        assert!(registry.get_device("lamp-1").unwrap().state.is_empty());
    }

    #[test]
    fn test_unknown_address_is_ignored() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        let diffs = registry.apply_telegram(&write_telegram(ga(9, 0, 9), vec![0x01]));
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_shared_address_updates_every_listener() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        registry.seed_device(lamp_seed("lamp-2", ga(1, 2, 3))).unwrap();

        let diffs = registry.apply_telegram(&write_telegram(ga(1, 2, 3), vec![0x01]));
        assert_eq!(diffs.len(), 2);
        let mut ids: Vec<&str> = diffs.iter().map(|d| d.device_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["lamp-1", "lamp-2"]);
    }

    #[test]
    fn test_decode_failure_counts_without_failing() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        let mut addresses = HashMap::new();
        addresses.insert(
            "temperature".to_string(),
            AddressBinding {
                group_address: ga(2, 0, 1),
                dpt: Dpt::Temperature,
                flags: BindingFlags::default(),
            },
        );
        registry
            .seed_device(DeviceSeed {
                id: "sensor-1".to_string(),
                name: String::new(),
                addresses,
                capabilities: vec![],
            })
            .unwrap();

        // One byte is too short for a 2-byte float
        let diffs = registry.apply_telegram(&write_telegram(ga(2, 0, 1), vec![0x0C]));
        assert!(diffs.is_empty());
        let device = registry.get_device("sensor-1").unwrap();
        assert_eq!(device.decode_errors, 1);
        assert!(device.state.is_empty());
    }

    #[test]
    fn test_invalid_sensor_value_stored_as_undefined() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        let mut addresses = HashMap::new();
        addresses.insert(
            "temperature".to_string(),
            AddressBinding {
                group_address: ga(2, 0, 1),
                dpt: Dpt::Temperature,
                flags: BindingFlags::default(),
            },
        );
        registry
            .seed_device(DeviceSeed {
                id: "sensor-1".to_string(),
                name: String::new(),
                addresses,
                capabilities: vec![],
            })
            .unwrap();

        let diffs = registry.apply_telegram(&write_telegram(ga(2, 0, 1), vec![0x7F, 0xFF]));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].value, DptValue::Undefined);
    }

    #[test]
    fn test_health_follows_activity_and_sweep() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        assert_eq!(
            registry.get_device("lamp-1").unwrap().health,
            DeviceHealth::Unknown
        );

        registry.apply_telegram(&write_telegram(ga(1, 2, 3), vec![0x01]));
        assert_eq!(
            registry.get_device("lamp-1").unwrap().health,
            DeviceHealth::Online
        );

        // Zero windows put any activity beyond both cutoffs
        let changed = registry.sweep_health(Duration::ZERO, Duration::ZERO);
        assert_eq!(changed, 1);
        assert_eq!(
            registry.get_device("lamp-1").unwrap().health,
            DeviceHealth::Offline
        );

        // Activity recovers the device
        registry.apply_telegram(&write_telegram(ga(1, 2, 3), vec![0x00]));
        assert_eq!(
            registry.get_device("lamp-1").unwrap().health,
            DeviceHealth::Online
        );
    }

    #[test]
    fn test_set_device_state_validates_and_dedups() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();

        let diff = registry
            .set_device_state("lamp-1", "switch", DptValue::Bool(true), DiffOrigin::Command)
            .unwrap();
        assert!(diff.is_some());

        let diff = registry
            .set_device_state("lamp-1", "switch", DptValue::Bool(true), DiffOrigin::Command)
            .unwrap();
        assert!(diff.is_none());

        assert!(matches!(
            registry.set_device_state("ghost", "switch", DptValue::Bool(true), DiffOrigin::Command),
            Err(RegistryError::UnknownDevice(_))
        ));
        assert!(matches!(
            registry.set_device_state("lamp-1", "volume", DptValue::Bool(true), DiffOrigin::Command),
            Err(RegistryError::UnknownAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_events_fan_out_to_subscribers() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        let mut rx = registry.subscribe();

        registry.apply_telegram(&write_telegram(ga(1, 2, 3), vec![0x01]));

        // Health change (Unknown -> Online) arrives before the diff
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RegistryEvent::HealthChanged { .. }));
        let second = rx.recv().await.unwrap();
        match second {
            RegistryEvent::StateChanged(diff) => {
                assert_eq!(diff.value, DptValue::Bool(true));
            },
            other => panic!("expected state change, got {:?}", other),
        }
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let registry = DeviceRegistry::new(RegistryConfig {
            event_capacity: 16,
            history_depth: 3,
        });
        let mut addresses = HashMap::new();
        addresses.insert(
            "level".to_string(),
            AddressBinding {
                group_address: ga(1, 0, 1),
                dpt: Dpt::CounterU8,
                flags: BindingFlags::default(),
            },
        );
        registry
            .seed_device(DeviceSeed {
                id: "dimmer-1".to_string(),
                name: String::new(),
                addresses,
                capabilities: vec![],
            })
            .unwrap();

        for raw in 1..=5u8 {
            registry.apply_telegram(&write_telegram(ga(1, 0, 1), vec![raw]));
        }
        let history = registry.history("dimmer-1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, DptValue::Float(3.0));
        assert_eq!(history[2].value, DptValue::Float(5.0));
    }

    #[test]
    fn test_remove_device_cleans_index() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        registry.remove_device("lamp-1").unwrap();
        assert!(registry.get_device("lamp-1").is_none());
        assert!(registry.targets_for(ga(1, 2, 3)).is_empty());
        assert!(registry.apply_telegram(&write_telegram(ga(1, 2, 3), vec![1])).is_empty());
    }

    #[test]
    fn test_readable_addresses_dedup() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        registry.seed_device(lamp_seed("lamp-1", ga(1, 2, 3))).unwrap();
        registry.seed_device(lamp_seed("lamp-2", ga(1, 2, 3))).unwrap();
        registry.seed_device(lamp_seed("lamp-3", ga(1, 2, 4))).unwrap();
        let addresses = registry.readable_addresses();
        assert_eq!(addresses.len(), 2);
    }
}
