//! Command dispatch
//!
//! One command in, one ack out, always. The ack reflects validation
//! and hand-off to the transport, never the device's eventual
//! reaction; that comes back later as a bus response telegram.

use std::sync::Arc;

use tracing::{debug, warn};

use domus_knx::{KnxError, Telegram};
use domus_registry::{DeviceRegistry, DiffOrigin};

use crate::bridge::{ack_codes, AckMessage, CommandMessage, MqttBridge};
use crate::transport::BusTransport;

/// Validate, encode, send, write through, ack
pub async fn handle_command(
    registry: &DeviceRegistry,
    transport: &Arc<dyn BusTransport>,
    bridge: &MqttBridge,
    command: CommandMessage,
) {
    debug!(
        "Command {} for {}: {} = {}",
        command.id, command.device_id, command.command, command.value
    );
    let ack = dispatch(registry, transport, &command).await;
    if let Err(e) = bridge.publish_ack(&ack).await {
        warn!("Failed to publish ack for command {}: {}", command.id, e);
    }
}

async fn dispatch(
    registry: &DeviceRegistry,
    transport: &Arc<dyn BusTransport>,
    command: &CommandMessage,
) -> AckMessage {
    let Some(device) = registry.get_device(&command.device_id) else {
        return AckMessage::failed(
            command,
            ack_codes::NOT_CONFIGURED,
            format!("unknown device '{}'", command.device_id),
        );
    };

    let Some(binding) = device.binding(&command.command) else {
        return AckMessage::failed(
            command,
            ack_codes::NOT_CONFIGURED,
            format!(
                "device '{}' has no function '{}'",
                command.device_id, command.command
            ),
        );
    };

    if !binding.flags.write {
        return AckMessage::failed(
            command,
            ack_codes::INVALID_COMMAND,
            format!("function '{}' is not writable", command.command),
        );
    }

    // Range and type validation happen in the encoder
    let payload = match binding.dpt.encode(&command.value) {
        Ok(payload) => payload,
        Err(e @ (KnxError::OutOfRange(_) | KnxError::MalformedPayload(_))) => {
            return AckMessage::failed(command, ack_codes::INVALID_PARAMETERS, e.to_string());
        },
        Err(e) => {
            return AckMessage::failed(command, ack_codes::PROTOCOL_ERROR, e.to_string());
        },
    };

    let telegram = Telegram::write(binding.group_address, payload);
    if let Err(e) = transport.send(&telegram).await {
        return AckMessage::failed(
            command,
            ack_codes::DEVICE_UNREACHABLE,
            format!("bus send failed: {}", e),
        );
    }

    // Write-through: the cache reflects the commanded value without
    // waiting for the bus echo, and dedup swallows that echo later
    if let Err(e) = registry.set_device_state(
        &command.device_id,
        &command.command,
        command.value.clone(),
        DiffOrigin::Command,
    ) {
        warn!(
            "Write-through failed for command {}: {}",
            command.id, e
        );
    }

    AckMessage::accepted(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use domus_knx::{Dpt, DptValue, GroupAddress};
    use domus_registry::{AddressBinding, BindingFlags, DeviceSeed, RegistryConfig};

    use crate::bridge::AckStatus;
    use crate::error::{BusSrvError, Result};
    use crate::transport::TransportStats;

    struct FakeTransport {
        sent: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl BusTransport for FakeTransport {
        async fn send(&self, _telegram: &Telegram) -> Result<()> {
            if self.fail {
                return Err(BusSrvError::not_connected());
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.fail
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn fake_transport(fail: bool) -> Arc<dyn BusTransport> {
        Arc::new(FakeTransport {
            sent: AtomicU64::new(0),
            fail,
        })
    }

    fn registry_with_lamp() -> DeviceRegistry {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        let mut addresses = HashMap::new();
        addresses.insert(
            "switch".to_string(),
            AddressBinding {
                group_address: GroupAddress::new(1, 2, 3).unwrap(),
                dpt: Dpt::Switch,
                flags: BindingFlags::default(),
            },
        );
        addresses.insert(
            "position".to_string(),
            AddressBinding {
                group_address: GroupAddress::new(1, 2, 4).unwrap(),
                dpt: Dpt::Percent,
                flags: BindingFlags {
                    write: false,
                    ..BindingFlags::default()
                },
            },
        );
        registry
            .seed_device(DeviceSeed {
                id: "lamp-1".to_string(),
                name: String::new(),
                addresses,
                capabilities: vec![],
            })
            .unwrap();
        registry
    }

    fn command(device_id: &str, function: &str, value: DptValue) -> CommandMessage {
        CommandMessage {
            id: "cmd-1".to_string(),
            timestamp: chrono::Utc::now(),
            device_id: device_id.to_string(),
            command: function.to_string(),
            value,
            source: None,
        }
    }

    #[tokio::test]
    async fn test_valid_command_accepted_and_written_through() {
        let registry = registry_with_lamp();
        let transport = fake_transport(false);

        let ack = dispatch(
            &registry,
            &transport,
            &command("lamp-1", "switch", DptValue::Bool(true)),
        )
        .await;
        assert_eq!(ack.status, AckStatus::Accepted);

        let device = registry.get_device("lamp-1").unwrap();
        assert_eq!(device.state.get("switch"), Some(&DptValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_unknown_device_not_configured() {
        let registry = registry_with_lamp();
        let transport = fake_transport(false);

        let ack = dispatch(
            &registry,
            &transport,
            &command("ghost", "switch", DptValue::Bool(true)),
        )
        .await;
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(ack.error_code.as_deref(), Some(ack_codes::NOT_CONFIGURED));
    }

    #[tokio::test]
    async fn test_read_only_function_rejected() {
        let registry = registry_with_lamp();
        let transport = fake_transport(false);

        let ack = dispatch(
            &registry,
            &transport,
            &command("lamp-1", "position", DptValue::Float(50.0)),
        )
        .await;
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(ack.error_code.as_deref(), Some(ack_codes::INVALID_COMMAND));
    }

    #[tokio::test]
    async fn test_out_of_range_value_rejected_before_send() {
        let registry = registry_with_lamp();
        let transport = fake_transport(false);

        let ack = dispatch(
            &registry,
            &transport,
            &command("lamp-1", "switch", DptValue::Float(1.0)),
        )
        .await;
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(
            ack.error_code.as_deref(),
            Some(ack_codes::INVALID_PARAMETERS)
        );
        // Nothing reached the cache
        let device = registry.get_device("lamp-1").unwrap();
        assert!(device.state.get("switch").is_none());
    }

    #[tokio::test]
    async fn test_bus_down_means_unreachable() {
        let registry = registry_with_lamp();
        let transport = fake_transport(true);

        let ack = dispatch(
            &registry,
            &transport,
            &command("lamp-1", "switch", DptValue::Bool(true)),
        )
        .await;
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(
            ack.error_code.as_deref(),
            Some(ack_codes::DEVICE_UNREACHABLE)
        );
    }
}
