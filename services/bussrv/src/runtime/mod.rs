//! Service runtime
//!
//! Wires transport → codec → registry → {bridge, hub} and owns the
//! worker tasks. Telegrams are applied by a single intake task so
//! per-device ordering matches bus arrival order; diffs fan out through
//! the registry broadcast to both distribution surfaces.

pub mod command;
pub mod health;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use domus_knx::Telegram;
use domus_registry::{DeviceRegistry, RegistryEvent};

use crate::bridge::{CommandMessage, MqttBridge, StateMessage};
use crate::config::BusSrvConfig;
use crate::error::{ErrorExt, Result};
use crate::hub::{channels, Hub, HubServer, TicketStore};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{BusTransport, KnxdTransport};

/// Assembled service
pub struct Runtime {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn BusTransport>,
    bridge: Option<Arc<MqttBridge>>,
    hub: Arc<Hub>,
    tickets: Arc<TicketStore>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    worker_faults: Arc<AtomicU64>,
    hub_addr: Option<std::net::SocketAddr>,
    cancel: CancellationToken,
    /// Stops the distribution side (fan-out, hub, command intake);
    /// separate from `cancel` so those stages survive the drain window
    pipeline_cancel: CancellationToken,
}

impl Runtime {
    /// Build and start every component from configuration
    pub async fn start(config: BusSrvConfig, cancel: CancellationToken) -> Result<Self> {
        let started_at = Instant::now();
        let worker_faults = Arc::new(AtomicU64::new(0));
        let pipeline_cancel = CancellationToken::new();

        // Registry, seeded from configuration
        let registry = Arc::new(DeviceRegistry::new(config.registry.to_registry()));
        for seed in config.devices.clone() {
            let id = seed.id.clone();
            registry
                .seed_device(seed)
                .config_error(&format!("seeding device '{}'", id))?;
        }
        info!("Registry seeded with {} device(s)", registry.device_count());

        // Daemon supervisor (probe-only when the daemon is unmanaged)
        let supervisor = Some(ProcessSupervisor::start(
            config.daemon.clone(),
            cancel.child_token(),
        ));

        // Bus transport
        let (knxd, telegram_rx) =
            KnxdTransport::start(config.transport.clone(), cancel.child_token());
        let transport: Arc<dyn BusTransport> = knxd;

        // Outbound bridge
        let bridge = if config.mqtt.enabled {
            let (bridge, command_rx) = MqttBridge::start(config.mqtt.clone());
            spawn_supervised(
                "commands",
                &worker_faults,
                command_loop(
                    registry.clone(),
                    transport.clone(),
                    bridge.clone(),
                    command_rx,
                    pipeline_cancel.child_token(),
                ),
            );
            Some(bridge)
        } else {
            None
        };

        // Realtime hub
        let hub = Arc::new(Hub::new());
        let tickets = Arc::new(TicketStore::new(config.hub.ticket_ttl()));
        let hub_addr = if config.hub.enabled {
            let server = HubServer::start(
                config.hub.clone(),
                hub.clone(),
                tickets.clone(),
                pipeline_cancel.child_token(),
            )
            .await?;
            Some(server.local_addr())
        } else {
            None
        };

        // Workers
        spawn_supervised(
            "intake",
            &worker_faults,
            intake_loop(registry.clone(), telegram_rx, cancel.child_token()),
        );
        spawn_supervised(
            "fanout",
            &worker_faults,
            fanout_loop(
                registry.clone(),
                registry.subscribe(),
                bridge.clone(),
                hub.clone(),
                pipeline_cancel.child_token(),
            ),
        );
        spawn_supervised(
            "health",
            &worker_faults,
            health::health_loop(
                health::HealthContext {
                    registry: registry.clone(),
                    transport: transport.clone(),
                    bridge: bridge.clone(),
                    supervisor: supervisor.clone(),
                    tickets: tickets.clone(),
                    worker_faults: worker_faults.clone(),
                    started_at,
                },
                config.registry.clone(),
                config.mqtt.clone(),
                pipeline_cancel.child_token(),
            ),
        );
        spawn_supervised(
            "read-all",
            &worker_faults,
            read_all(
                registry.clone(),
                transport.clone(),
                config.transport.connect_timeout(),
                config.transport.inter_read_delay(),
                cancel.child_token(),
            ),
        );

        Ok(Self {
            registry,
            transport,
            bridge,
            hub,
            tickets,
            supervisor,
            worker_faults,
            hub_addr,
            cancel,
            pipeline_cancel,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Issue a hub connect ticket (the external issuer seam, in-process)
    pub fn issue_ticket(&self) -> String {
        self.tickets.issue()
    }

    /// Bound hub listener address, when the hub is enabled
    pub fn hub_addr(&self) -> Option<std::net::SocketAddr> {
        self.hub_addr
    }

    pub fn worker_faults(&self) -> u64 {
        self.worker_faults.load(Ordering::Relaxed)
    }

    /// Ordered teardown
    ///
    /// Stages: the intake side stops first, a short drain window lets
    /// queued diffs still fan out to consumers, the bus connection
    /// closes, then the distribution side stops and the bridge
    /// publishes its retained offline record as the final word.
    pub async fn shutdown(&self) {
        info!("Runtime shutting down");
        // Sources only: supervisor, transport reader, intake
        self.cancel.cancel();

        // Fan-out, hub and bridge stay up for what is still queued
        tokio::time::sleep(Duration::from_millis(200)).await;

        if let Err(e) = self.transport.close().await {
            warn!("Transport close failed: {}", e);
        }

        self.pipeline_cancel.cancel();
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.close().await {
                warn!("Bridge close failed: {}", e);
            }
        }
        if let Some(supervisor) = &self.supervisor {
            debug!("Daemon supervisor was {}", supervisor.state());
        }
        info!("Runtime stopped");
    }
}

/// Spawn a worker whose panic is contained and counted
///
/// A panicking worker takes its pipeline stage down but leaves the
/// process and the other stages alive; the health loop reports the
/// service as degraded from then on.
fn spawn_supervised(
    name: &'static str,
    worker_faults: &Arc<AtomicU64>,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let worker_faults = worker_faults.clone();
    tokio::spawn(async move {
        match std::panic::AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => debug!("Worker '{}' finished", name),
            Err(_) => {
                worker_faults.fetch_add(1, Ordering::Relaxed);
                error!("Worker '{}' panicked", name);
            },
        }
    });
}

// ============================================================================
// Workers
// ============================================================================

/// Single reader: bus arrival order is registry application order
async fn intake_loop(
    registry: Arc<DeviceRegistry>,
    mut telegram_rx: mpsc::Receiver<Telegram>,
    cancel: CancellationToken,
) {
    loop {
        let telegram = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = telegram_rx.recv() => match maybe {
                Some(telegram) => telegram,
                None => break,
            },
        };
        let diffs = registry.apply_telegram(&telegram);
        if !diffs.is_empty() {
            debug!("{} produced {} diff(s)", telegram, diffs.len());
        }
    }
    debug!("Intake stopped");
}

/// Registry events → MQTT retained state + hub channels
async fn fanout_loop(
    registry: Arc<DeviceRegistry>,
    mut events: broadcast::Receiver<RegistryEvent>,
    bridge: Option<Arc<MqttBridge>>,
    hub: Arc<Hub>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Fan-out lagged, {} event(s) lost", n);
                    continue;
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match &event {
            RegistryEvent::StateChanged(diff) => {
                if let Ok(data) = serde_json::to_value(diff) {
                    hub.broadcast(channels::STATE_CHANGED, data);
                }
                if let Some(bridge) = &bridge {
                    let address = registry
                        .get_device(&diff.device_id)
                        .and_then(|d| d.binding(&diff.function).map(|b| b.group_address));
                    if let Some(address) = address {
                        let message = StateMessage::from_diff(diff, address);
                        if let Err(e) = bridge.publish_state(&message).await {
                            warn!("State publish failed: {}", e);
                        }
                    }
                }
            },
            RegistryEvent::HealthChanged { .. } => {
                if let Ok(data) = serde_json::to_value(&event) {
                    hub.broadcast(channels::HEALTH_CHANGED, data);
                }
            },
        }
    }
    debug!("Fan-out stopped");
}

/// Inbound commands from the bridge
async fn command_loop(
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn BusTransport>,
    bridge: Arc<MqttBridge>,
    mut command_rx: mpsc::Receiver<CommandMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = command_rx.recv() => match maybe {
                Some(message) => message,
                None => break,
            },
        };
        command::handle_command(&registry, &transport, &bridge, message).await;
    }
    debug!("Command loop stopped");
}

/// One-shot startup sync: ask the bus for every readable address
///
/// Paced by the inter-read delay so the request burst does not flood
/// the bus; responses flow back through the normal intake path.
async fn read_all(
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn BusTransport>,
    connect_timeout: Duration,
    inter_read_delay: Duration,
    cancel: CancellationToken,
) {
    // Wait for the first connection
    let deadline = Instant::now() + connect_timeout;
    while !transport.is_connected() {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            debug!("Skipping initial read-all, bus not connected");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let addresses = registry.readable_addresses();
    info!("Reading {} address(es) for initial state", addresses.len());
    for address in addresses {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = transport.send(&Telegram::read(address)).await {
            warn!("Initial read of {} failed: {}", address, e);
            return;
        }
        tokio::time::sleep(inter_read_delay).await;
    }
}
