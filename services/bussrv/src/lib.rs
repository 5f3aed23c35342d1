//! Bus service
//!
//! Data-plane core of the building-automation controller: supervises
//! the external bus daemon, maintains the daemon connection, feeds
//! decoded telegrams into the device registry, and distributes state
//! changes outward over MQTT and websocket.

pub mod bridge;
pub mod config;
pub mod error;
pub mod hub;
pub mod runtime;
pub mod supervisor;
pub mod transport;

pub mod test_utils;

pub use config::BusSrvConfig;
pub use error::{BusSrvError, ErrorExt, Result};
