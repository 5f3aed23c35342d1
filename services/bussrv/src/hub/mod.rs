//! Realtime fan-out hub
//!
//! Websocket push of registry events to interactive clients. Sits
//! beside the MQTT bridge, not behind it: both consume the same
//! registry broadcast.

pub mod protocol;
pub mod server;
pub mod sessions;
pub mod ticket;

pub use sessions::{Hub, HubStats};
pub use protocol::{channels, ClientMessage, ServerMessage};
pub use server::HubServer;
pub use ticket::{TicketStore, TicketValidator};
