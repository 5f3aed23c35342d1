//! MQTT distribution bridge
//!
//! Publishes retained device state, command acks, discovery records and
//! a retained health heartbeat; consumes commands from the command
//! topic tree. The broker holds a retained "offline" last will so
//! consumers see the bridge die even when it cannot say goodbye.
//!
//! Publishes while disconnected are dropped with a warning and counted,
//! never queued: retained state means a reconnecting consumer resyncs
//! from the broker anyway.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::messages::{AckMessage, AckStatus, CommandMessage, HealthMessage, ack_codes};
use crate::bridge::topics;
use crate::config::MqttConfig;
use crate::error::{BusSrvError, Result};
use crate::transport::{backoff_delay, ReconnectPolicy};

/// Bounded queue between the broker event loop and the command handler
const COMMAND_QUEUE: usize = 64;

/// How long `close` waits for the event loop to flush and stop
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound MQTT bridge handle
pub struct MqttBridge {
    client: AsyncClient,
    config: MqttConfig,
    connected: Arc<AtomicBool>,
    dropped_publishes: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBridge {
    /// Connect to the broker and start the event loop task
    ///
    /// Returns the handle and the inbound command channel. The event
    /// loop owns its own lifetime: it keeps the session alive with
    /// backoff until `close` stops it, so the session outlives the
    /// runtime's worker cancellation and the final publishes still get
    /// polled out.
    pub fn start(config: MqttConfig) -> (Arc<Self>, mpsc::Receiver<CommandMessage>) {
        let mut options = MqttOptions::new(
            &config.client_id,
            &config.broker_host,
            config.broker_port,
        );
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics::health(&config.namespace),
            HealthMessage::offline_payload(),
            qos_from(config.qos),
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(event_loop(
            eventloop,
            client.clone(),
            config.clone(),
            connected.clone(),
            command_tx,
            cancel.clone(),
        ));

        let bridge = Arc::new(Self {
            client,
            config,
            connected,
            dropped_publishes: AtomicU64::new(0),
            cancel,
            task: Mutex::new(Some(task)),
        });

        (bridge, command_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publishes dropped because the broker was unreachable
    pub fn dropped_publishes(&self) -> u64 {
        self.dropped_publishes.load(Ordering::Relaxed)
    }

    /// Retained device state
    pub async fn publish_state(&self, message: &super::messages::StateMessage) -> Result<()> {
        let topic = topics::state(&self.config.namespace, message.address);
        self.publish(&topic, serde_json::to_vec(message)?, true).await
    }

    /// Command acknowledgement (not retained)
    pub async fn publish_ack(&self, ack: &AckMessage) -> Result<()> {
        let topic = topics::ack(&self.config.namespace, &ack.device_id);
        self.publish(&topic, serde_json::to_vec(ack)?, false).await
    }

    /// Retained health heartbeat
    pub async fn publish_health(&self, health: &HealthMessage) -> Result<()> {
        let topic = topics::health(&self.config.namespace);
        self.publish(&topic, serde_json::to_vec(health)?, true).await
    }

    /// Retained device discovery record
    pub async fn publish_discovery(
        &self,
        message: &super::messages::DiscoveryMessage,
    ) -> Result<()> {
        let topic = topics::discovery(&self.config.namespace, &message.device_id);
        self.publish(&topic, serde_json::to_vec(message)?, true).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if !self.is_connected() {
            self.dropped_publishes.fetch_add(1, Ordering::Relaxed);
            warn!("Broker unreachable, dropping publish to {}", topic);
            return Ok(());
        }
        self.client
            .publish(topic, qos_from(self.config.qos), retain, payload)
            .await?;
        debug!("Published to {}", topic);
        Ok(())
    }

    /// Publish the retained offline health record, then end the session
    ///
    /// The event loop keeps polling until the disconnect goes out over
    /// the wire, so the offline record reaches the broker ahead of the
    /// socket closing; the last will stays reserved for the crash path.
    pub async fn close(&self) -> Result<()> {
        if self.is_connected() {
            let topic = topics::health(&self.config.namespace);
            if let Err(e) = self
                .client
                .publish(
                    &topic,
                    qos_from(self.config.qos),
                    true,
                    HealthMessage::offline_payload(),
                )
                .await
            {
                warn!("Offline record publish failed: {}", e);
            }
            if let Err(e) = self.client.disconnect().await {
                debug!("Disconnect request failed: {}", e);
            }
        } else {
            // Nothing to flush; stop the loop directly
            self.cancel.cancel();
        }
        self.connected.store(false, Ordering::SeqCst);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if tokio::time::timeout(FLUSH_TIMEOUT, task).await.is_err() {
                self.cancel.cancel();
                return Err(BusSrvError::bridge(
                    "event loop did not flush the final publishes in time",
                ));
            }
        }
        Ok(())
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

// ============================================================================
// Broker event loop
// ============================================================================

async fn event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    config: MqttConfig,
    connected: Arc<AtomicBool>,
    command_tx: mpsc::Sender<CommandMessage>,
    cancel: CancellationToken,
) {
    let policy = ReconnectPolicy::from_config(
        config.reconnect_max_attempts,
        config.reconnect_initial_delay_ms,
        config.reconnect_max_delay_ms,
        config.reconnect_backoff_multiplier,
    );
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!(
                    "Connected to MQTT broker {}:{}",
                    config.broker_host, config.broker_port
                );
                let filter = topics::command_filter(&config.namespace);
                if let Err(e) = client.subscribe(&filter, qos_from(config.qos)).await {
                    error!("Failed to subscribe to {}: {}", filter, e);
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_command(&client, &config, &command_tx, publish).await;
            },
            // Orderly shutdown: the disconnect request queued by `close`
            // has gone out, and everything queued before it with it
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                attempt += 1;
                if policy.max_attempts > 0 && attempt > policy.max_attempts {
                    error!("MQTT broker unreachable, bridge giving up: {}", e);
                    break;
                }
                let delay = backoff_delay(&policy, attempt);
                warn!(
                    "MQTT connection error (attempt {}): {}, retrying in {:?}",
                    attempt, e, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {},
                }
            },
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}

/// Parse an inbound command publish and hand it to the runtime
///
/// A payload that does not even parse gets its failed ack here; anything
/// better-formed is acked by the command handler after validation.
async fn handle_command(
    client: &AsyncClient,
    config: &MqttConfig,
    command_tx: &mpsc::Sender<CommandMessage>,
    publish: Publish,
) {
    let Some(device_id) = topics::parse_command(&config.namespace, &publish.topic) else {
        debug!("Ignoring publish on non-command topic {}", publish.topic);
        return;
    };

    match serde_json::from_slice::<CommandMessage>(&publish.payload) {
        Ok(mut command) => {
            // The topic is authoritative for the device id
            command.device_id = device_id;
            if command_tx.send(command).await.is_err() {
                warn!("Command handler gone, dropping command");
            }
        },
        Err(e) => {
            warn!("Unparseable command for {}: {}", device_id, e);
            let id = serde_json::from_slice::<serde_json::Value>(&publish.payload)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_string)))
                .unwrap_or_else(|| "unknown".to_string());
            let ack = AckMessage {
                id,
                device_id: device_id.clone(),
                status: AckStatus::Failed,
                error_code: Some(ack_codes::INVALID_COMMAND.to_string()),
                error: Some(e.to_string()),
                timestamp: Utc::now(),
            };
            let topic = topics::ack(&config.namespace, &device_id);
            match serde_json::to_vec(&ack) {
                Ok(payload) => {
                    if let Err(e) = client
                        .publish(&topic, qos_from(config.qos), false, payload)
                        .await
                    {
                        warn!("Failed to publish parse-failure ack: {}", e);
                    }
                },
                Err(e) => warn!("Failed to encode parse-failure ack: {}", e),
            }
        },
    }
}
