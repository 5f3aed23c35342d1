//! Outbound distribution bridge
//!
//! Everything that crosses the MQTT boundary: topic construction, wire
//! payloads, and the broker client.

pub mod messages;
pub mod mqtt;
pub mod topics;

pub use messages::{
    ack_codes, AckMessage, AckStatus, CommandMessage, ConnectionInfo, DiscoveryMessage,
    HealthMessage, StateMessage, TrafficInfo,
};
pub use mqtt::MqttBridge;
