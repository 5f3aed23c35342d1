//! Service health loop
//!
//! Periodic housekeeping in one task: registry health sweeps, ticket
//! purging, the retained MQTT heartbeat, and the one-shot discovery
//! publish once the broker is reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use domus_registry::DeviceRegistry;

use crate::bridge::{ConnectionInfo, DiscoveryMessage, HealthMessage, MqttBridge, TrafficInfo};
use crate::config::{MqttConfig, RegistryConfig};
use crate::hub::TicketStore;
use crate::supervisor::{ProcessSupervisor, SupervisorState};
use crate::transport::BusTransport;

/// Everything the health loop reads
pub struct HealthContext {
    pub registry: Arc<DeviceRegistry>,
    pub transport: Arc<dyn BusTransport>,
    pub bridge: Option<Arc<MqttBridge>>,
    pub supervisor: Option<Arc<ProcessSupervisor>>,
    pub tickets: Arc<TicketStore>,
    pub worker_faults: Arc<AtomicU64>,
    pub started_at: Instant,
}

pub async fn health_loop(
    ctx: HealthContext,
    registry_config: RegistryConfig,
    mqtt_config: MqttConfig,
    cancel: CancellationToken,
) {
    let mut sweep_tick = tokio::time::interval(registry_config.sweep_interval());
    let mut heartbeat_tick = tokio::time::interval(mqtt_config.heartbeat_interval());
    let mut discovery_published = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep_tick.tick() => {
                let changed = ctx.registry.sweep_health(
                    registry_config.stale_after(),
                    registry_config.offline_after(),
                );
                if changed > 0 {
                    info!("Health sweep: {} device(s) changed state", changed);
                }
                ctx.tickets.purge_expired();
            },
            _ = heartbeat_tick.tick() => {
                let Some(bridge) = &ctx.bridge else { continue };
                if bridge.is_connected() && !discovery_published {
                    publish_discovery(&ctx.registry, bridge).await;
                    discovery_published = true;
                }
                let health = build_health(&ctx);
                if let Err(e) = bridge.publish_health(&health).await {
                    warn!("Failed to publish heartbeat: {}", e);
                }
            },
        }
    }
}

/// Retained discovery record for every seeded device
async fn publish_discovery(registry: &DeviceRegistry, bridge: &MqttBridge) {
    for device in registry.list_devices() {
        let message = DiscoveryMessage::from_device(&device);
        if let Err(e) = bridge.publish_discovery(&message).await {
            warn!("Failed to publish discovery for {}: {}", device.id, e);
        }
    }
    info!("Published discovery for {} device(s)", registry.device_count());
}

fn build_health(ctx: &HealthContext) -> HealthMessage {
    let transport_stats = ctx.transport.stats();
    let daemon_state = ctx
        .supervisor
        .as_ref()
        .map(|s| s.state())
        .unwrap_or(SupervisorState::Stopped);

    let degraded = ctx.worker_faults.load(Ordering::Relaxed) > 0
        || daemon_state == SupervisorState::Degraded;

    HealthMessage {
        bridge: "bussrv".to_string(),
        status: if degraded { "degraded" } else { "online" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs(),
        connection: ConnectionInfo {
            bus_connected: ctx.transport.is_connected(),
            daemon_state: daemon_state.to_string(),
        },
        statistics: TrafficInfo {
            telegrams_sent: transport_stats.telegrams_sent,
            telegrams_received: transport_stats.telegrams_received,
            frame_errors: transport_stats.frame_errors,
            reconnects: transport_stats.reconnects,
        },
        devices_managed: ctx.registry.device_count(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use domus_knx::Telegram;
    use domus_registry::RegistryConfig as CacheConfig;

    use crate::error::Result;
    use crate::transport::TransportStats;

    struct IdleTransport;

    #[async_trait]
    impl BusTransport for IdleTransport {
        async fn send(&self, _telegram: &Telegram) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn stats(&self) -> TransportStats {
            TransportStats {
                telegrams_sent: 3,
                telegrams_received: 7,
                ..TransportStats::default()
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_health_message_reflects_faults() {
        let ctx = HealthContext {
            registry: Arc::new(DeviceRegistry::new(CacheConfig::default())),
            transport: Arc::new(IdleTransport),
            bridge: None,
            supervisor: None,
            tickets: Arc::new(TicketStore::new(Duration::from_secs(60))),
            worker_faults: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        };

        let health = build_health(&ctx);
        assert_eq!(health.status, "online");
        assert!(health.connection.bus_connected);
        assert_eq!(health.statistics.telegrams_received, 7);

        ctx.worker_faults.store(1, Ordering::Relaxed);
        let health = build_health(&ctx);
        assert_eq!(health.status, "degraded");
    }
}
