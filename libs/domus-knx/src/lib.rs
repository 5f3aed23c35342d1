//! KNX protocol codec
//!
//! Pure encoding/decoding for KNX group communication via a knxd-style
//! bus daemon. No I/O lives in this crate; the bus service owns sockets
//! and reconnection.
//!
//! Modules:
//! - [`address`]: group and individual addresses
//! - [`dpt`]: datapoint type encoding/decoding
//! - [`telegram`]: group telegrams and APCI handling
//! - [`frame`]: daemon wire message framing

pub mod address;
pub mod dpt;
pub mod error;
pub mod frame;
pub mod telegram;

pub use address::{GroupAddress, IndividualAddress};
pub use dpt::{Dpt, DptValue, Rgb};
pub use error::{KnxError, Result};
pub use telegram::{Apci, Telegram};
