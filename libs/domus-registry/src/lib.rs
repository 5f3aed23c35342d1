//! Concurrent device state cache
//!
//! Holds the authoritative in-memory state of every managed device and
//! turns raw bus telegrams into deduplicated state diff events. The
//! registry is the single source of truth consumed by the outbound
//! bridge and the realtime fan-out hub; neither ever touches the bus
//! directly.

pub mod device;
pub mod diff;
pub mod error;
pub mod registry;

pub use device::{AddressBinding, BindingFlags, Device, DeviceHealth, DeviceSeed};
pub use diff::{DiffOrigin, RegistryEvent, StateDiff};
pub use error::{RegistryError, Result};
pub use registry::{DeviceRegistry, RegistryConfig, RegistryStats};
