//! Service configuration
//!
//! Loaded from a single YAML file. Every timeout, backoff ceiling and
//! queue bound is a field with a default rather than a compile-time
//! constant, so deployments can tune them without rebuilding.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use domus_registry::DeviceSeed;

use crate::error::{ErrorExt, Result};

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSrvConfig {
    pub daemon: DaemonConfig,
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
    pub mqtt: MqttConfig,
    pub hub: HubConfig,
    /// Devices seeded into the registry at startup
    pub devices: Vec<DeviceSeed>,
}

impl BusSrvConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .io_error(&format!("reading config {}", path.display()))?;
        let config: BusSrvConfig =
            serde_yaml::from_str(&raw).config_error("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field sanity checks that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        use crate::error::BusSrvError;
        if self.transport.telegram_queue == 0 {
            return Err(BusSrvError::config("transport.telegram_queue must be > 0"));
        }
        if self.hub.enabled && self.hub.client_queue == 0 {
            return Err(BusSrvError::config("hub.client_queue must be > 0"));
        }
        if self.registry.stale_after_secs >= self.registry.offline_after_secs {
            return Err(BusSrvError::config(
                "registry.stale_after_secs must be below registry.offline_after_secs",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Daemon supervisor
// ============================================================================

/// External bus daemon process management
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Whether this service owns the daemon process; when false the
    /// daemon is expected to run externally and only the transport is
    /// used
    pub managed: bool,
    /// Daemon binary path
    pub binary: String,
    /// Additional daemon arguments
    pub args: Vec<String>,
    /// TCP port the daemon listens on (used for readiness and liveness
    /// probing)
    pub tcp_port: u16,
    /// Base delay before a restart attempt
    pub restart_delay_ms: u64,
    /// Exponential backoff multiplier between restart attempts
    pub restart_backoff_multiplier: f64,
    /// Backoff ceiling for restart delays
    pub restart_max_delay_ms: u64,
    /// Consecutive restart failures before escalating to degraded
    /// (0 = retry forever)
    pub max_restart_attempts: u32,
    /// Minimum uptime before the restart counter resets
    pub restart_cooldown_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub graceful_timeout_ms: u64,
    /// Liveness probe interval
    pub health_check_interval_ms: u64,
    /// Total time to wait for the daemon socket after spawn
    pub ready_timeout_ms: u64,
    /// Poll interval while waiting for readiness
    pub ready_poll_interval_ms: u64,
    /// Per-poll TCP dial timeout
    pub ready_dial_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            managed: true,
            binary: "/usr/bin/knxd".to_string(),
            args: Vec::new(),
            tcp_port: 6720,
            restart_delay_ms: 5_000,
            restart_backoff_multiplier: 2.0,
            restart_max_delay_ms: 60_000,
            max_restart_attempts: 10,
            restart_cooldown_ms: 60_000,
            graceful_timeout_ms: 10_000,
            health_check_interval_ms: 30_000,
            ready_timeout_ms: 30_000,
            ready_poll_interval_ms: 100,
            ready_dial_timeout_ms: 500,
        }
    }
}

impl DaemonConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Daemon connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Daemon endpoint: `tcp://host:port` or `unix:///path/to/socket`
    pub url: String,
    /// Connect timeout
    pub connect_timeout_ms: u64,
    /// Bounded capacity of the inbound telegram channel
    pub telegram_queue: usize,
    /// Delay between consecutive read requests during read-all, to keep
    /// request floods off the bus
    pub inter_read_delay_ms: u64,
    /// Reconnect attempts before giving up (0 = unlimited)
    pub reconnect_max_attempts: u32,
    /// Initial reconnect delay
    pub reconnect_initial_delay_ms: u64,
    /// Reconnect delay ceiling
    pub reconnect_max_delay_ms: u64,
    /// Reconnect backoff multiplier
    pub reconnect_backoff_multiplier: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:6720".to_string(),
            connect_timeout_ms: 10_000,
            telegram_queue: 256,
            inter_read_delay_ms: 50,
            reconnect_max_attempts: 0,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_backoff_multiplier: 2.0,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn inter_read_delay(&self) -> Duration {
        Duration::from_millis(self.inter_read_delay_ms)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Device cache thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Broadcast channel capacity for diff events
    pub event_capacity: usize,
    /// Per-device state history depth (0 disables)
    pub history_depth: usize,
    /// Seconds without activity before a device turns stale
    pub stale_after_secs: u64,
    /// Seconds without activity before a device turns offline
    pub offline_after_secs: u64,
    /// Health sweep interval
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            history_depth: 64,
            stale_after_secs: 120,
            offline_after_secs: 600,
            sweep_interval_secs: 30,
        }
    }
}

impl RegistryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn to_registry(&self) -> domus_registry::RegistryConfig {
        domus_registry::RegistryConfig {
            event_capacity: self.event_capacity,
            history_depth: self.history_depth,
        }
    }
}

// ============================================================================
// Outbound bridge
// ============================================================================

/// MQTT distribution bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic namespace prefix
    pub namespace: String,
    /// QoS for state/health publishes (0, 1 or 2)
    pub qos: u8,
    pub keep_alive_secs: u64,
    /// Retained health heartbeat interval
    pub heartbeat_interval_secs: u64,
    /// Reconnect attempts before giving up (0 = unlimited)
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_backoff_multiplier: f64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: "domus-bussrv".to_string(),
            username: None,
            password: None,
            namespace: "domus".to_string(),
            qos: 1,
            keep_alive_secs: 30,
            heartbeat_interval_secs: 30,
            reconnect_max_attempts: 0,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_backoff_multiplier: 2.0,
        }
    }
}

impl MqttConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// ============================================================================
// Realtime hub
// ============================================================================

/// Websocket fan-out hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub enabled: bool,
    /// Listener bind address
    pub bind: String,
    /// Per-client bounded send queue depth
    pub client_queue: usize,
    /// Single-use connect ticket time-to-live
    pub ticket_ttl_secs: u64,
    /// Server ping interval
    pub ping_interval_secs: u64,
    /// Client considered dead after this long without a pong
    pub pong_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8420".to_string(),
            client_queue: 256,
            ticket_ttl_secs: 60,
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
        }
    }
}

impl HubConfig {
    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusSrvConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.daemon.managed);
        assert_eq!(config.daemon.tcp_port, 6720);
        assert_eq!(config.transport.telegram_queue, 256);
    }

    #[test]
    fn test_load_partial_yaml() {
        let yaml = r#"
daemon:
  managed: false
transport:
  url: "unix:///run/knxd.sock"
mqtt:
  broker_host: "broker.local"
  namespace: "home"
devices:
  - id: lamp-1
    name: Desk lamp
    addresses:
      switch:
        group_address: "1/2/3"
        dpt: "1.001"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = BusSrvConfig::load(file.path()).unwrap();
        assert!(!config.daemon.managed);
        assert_eq!(config.transport.url, "unix:///run/knxd.sock");
        assert_eq!(config.mqtt.namespace, "home");
        // Untouched sections keep their defaults
        assert_eq!(config.daemon.tcp_port, 6720);
        assert_eq!(config.devices.len(), 1);
        let binding = &config.devices[0].addresses["switch"];
        assert_eq!(binding.group_address.to_string(), "1/2/3");
    }

    #[test]
    fn test_validation_rejects_inverted_windows() {
        let mut config = BusSrvConfig::default();
        config.registry.stale_after_secs = 900;
        config.registry.offline_after_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let mut config = BusSrvConfig::default();
        config.transport.telegram_queue = 0;
        assert!(config.validate().is_err());
    }
}
