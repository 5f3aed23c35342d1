//! KNX addressing
//!
//! Two distinct address kinds exist on the bus and must never be mixed:
//! group addresses (`main/middle/sub`) target a logical function shared
//! by many devices, while individual addresses (`area.line.device`)
//! identify a single physical device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KnxError, Result};

/// Maximum main group for 3-level group addresses (5 bits)
pub const GROUP_MAIN_MAX: u8 = 31;
/// Maximum middle group for 3-level group addresses (3 bits)
pub const GROUP_MIDDLE_MAX: u8 = 7;

// ============================================================================
// Group Address
// ============================================================================

/// Three-level KNX group address, e.g. `1/2/3`
///
/// Wire layout (16 bits, big endian on the bus):
/// `MMMMM III SSSSSSSS` — main (5 bits), middle (3 bits), sub (8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    pub main: u8,
    pub middle: u8,
    pub sub: u8,
}

impl GroupAddress {
    /// Create a group address, validating each level against its bit width
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > GROUP_MAIN_MAX {
            return Err(KnxError::invalid_address(format!(
                "main group {} exceeds maximum {}",
                main, GROUP_MAIN_MAX
            )));
        }
        if middle > GROUP_MIDDLE_MAX {
            return Err(KnxError::invalid_address(format!(
                "middle group {} exceeds maximum {}",
                middle, GROUP_MIDDLE_MAX
            )));
        }
        // sub is a full byte, always in range
        Ok(Self { main, middle, sub })
    }

    /// Decode from the 16-bit wire representation
    pub fn from_u16(raw: u16) -> Self {
        Self {
            main: ((raw >> 11) & 0x1F) as u8,
            middle: ((raw >> 8) & 0x07) as u8,
            sub: (raw & 0xFF) as u8,
        }
    }

    /// Encode to the 16-bit wire representation
    pub fn to_u16(self) -> u16 {
        ((self.main as u16) << 11) | ((self.middle as u16) << 8) | (self.sub as u16)
    }

    /// Topic-safe form with `/` escaped as `%2F`, e.g. `1%2F2%2F3`
    ///
    /// Group addresses appear in MQTT topic segments where `/` is the
    /// level separator and must not leak through.
    pub fn to_topic(self) -> String {
        format!("{}%2F{}%2F{}", self.main, self.middle, self.sub)
    }

    /// Parse the topic-safe form produced by [`GroupAddress::to_topic`]
    pub fn from_topic(s: &str) -> Result<Self> {
        s.replace("%2F", "/").parse()
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main, self.middle, self.sub)
    }
}

impl FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(KnxError::invalid_address(format!(
                "group address '{}' must have form main/middle/sub",
                s
            )));
        }
        let parse_level = |part: &str, name: &str| -> Result<u8> {
            part.parse::<u8>().map_err(|_| {
                KnxError::invalid_address(format!("group address '{}': bad {} level", s, name))
            })
        };
        Self::new(
            parse_level(parts[0], "main")?,
            parse_level(parts[1], "middle")?,
            parse_level(parts[2], "sub")?,
        )
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Individual Address
// ============================================================================

/// KNX individual (physical) address, e.g. `1.1.5`
///
/// Wire layout (16 bits): area (4 bits), line (4 bits), device (8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndividualAddress {
    pub area: u8,
    pub line: u8,
    pub device: u8,
}

impl IndividualAddress {
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > 0x0F {
            return Err(KnxError::invalid_address(format!(
                "area {} exceeds maximum 15",
                area
            )));
        }
        if line > 0x0F {
            return Err(KnxError::invalid_address(format!(
                "line {} exceeds maximum 15",
                line
            )));
        }
        Ok(Self { area, line, device })
    }

    pub fn from_u16(raw: u16) -> Self {
        Self {
            area: ((raw >> 12) & 0x0F) as u8,
            line: ((raw >> 8) & 0x0F) as u8,
            device: (raw & 0xFF) as u8,
        }
    }

    pub fn to_u16(self) -> u16 {
        ((self.area as u16) << 12) | ((self.line as u16) << 8) | (self.device as u16)
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area, self.line, self.device)
    }
}

impl FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(KnxError::invalid_address(format!(
                "individual address '{}' must have form area.line.device",
                s
            )));
        }
        let parse_level = |part: &str, name: &str| -> Result<u8> {
            part.parse::<u8>().map_err(|_| {
                KnxError::invalid_address(format!(
                    "individual address '{}': bad {} level",
                    s, name
                ))
            })
        };
        Self::new(
            parse_level(parts[0], "area")?,
            parse_level(parts[1], "line")?,
            parse_level(parts[2], "device")?,
        )
    }
}

impl Serialize for IndividualAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IndividualAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
