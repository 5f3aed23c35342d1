//! KNX group telegrams
//!
//! A telegram is the unit of group communication on the bus: an APCI
//! service code (read / response / write) plus an optional DPT-encoded
//! payload, addressed to a group address. Telegrams are immutable once
//! decoded.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::address::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};

/// Minimum length of a received group packet:
/// source(2) + destination(2) + TPCI(1) + APCI(1)
const GROUP_PACKET_MIN: usize = 6;

// ============================================================================
// APCI
// ============================================================================

/// Application-layer service code (upper two bits of the APCI byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Apci {
    /// Group value read request
    Read,
    /// Group value response (answer to a read)
    Response,
    /// Group value write
    Write,
}

impl Apci {
    /// Decode from a raw APCI byte (lower six bits may carry data)
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte & 0xC0 {
            0x00 => Ok(Apci::Read),
            0x40 => Ok(Apci::Response),
            0x80 => Ok(Apci::Write),
            other => Err(KnxError::malformed(format!(
                "unknown APCI service code 0x{:02X}",
                other
            ))),
        }
    }

    /// The service code bits
    pub fn to_byte(self) -> u8 {
        match self {
            Apci::Read => 0x00,
            Apci::Response => 0x40,
            Apci::Write => 0x80,
        }
    }
}

impl fmt::Display for Apci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Apci::Read => "READ",
            Apci::Response => "RESPONSE",
            Apci::Write => "WRITE",
        })
    }
}

// ============================================================================
// Telegram
// ============================================================================

/// A KNX group telegram
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    /// Sender's individual address; populated for received telegrams
    /// only, the daemon fills it in for outgoing ones
    pub source: Option<IndividualAddress>,
    /// Target group address
    pub destination: GroupAddress,
    /// Service code
    pub apci: Apci,
    /// DPT-encoded payload (empty for read requests)
    pub payload: Vec<u8>,
    /// When the telegram was received or created
    pub received_at: DateTime<Utc>,
}

impl Telegram {
    /// Create a group write telegram
    pub fn write(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Self {
            source: None,
            destination,
            apci: Apci::Write,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Create a group read request telegram
    pub fn read(destination: GroupAddress) -> Self {
        Self {
            source: None,
            destination,
            apci: Apci::Read,
            payload: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Create a group response telegram
    pub fn response(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Self {
            source: None,
            destination,
            apci: Apci::Response,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn is_write(&self) -> bool {
        self.apci == Apci::Write
    }

    pub fn is_read(&self) -> bool {
        self.apci == Apci::Read
    }

    pub fn is_response(&self) -> bool {
        self.apci == Apci::Response
    }

    /// Parse a received group packet payload
    ///
    /// The receive format carries a source address prefix that the send
    /// format does not (an asymmetry of the daemon's group socket):
    ///
    /// ```text
    /// byte 0-1: source individual address (big endian)
    /// byte 2-3: destination group address (big endian)
    /// byte 4:   TPCI (0x00 for group communication)
    /// byte 5:   APCI | value (lower 6 bits carry short-frame data)
    /// byte 6+:  payload bytes for long frames
    /// ```
    pub fn parse_group_packet(data: &[u8]) -> Result<Self> {
        if data.len() < GROUP_PACKET_MIN {
            return Err(KnxError::malformed(format!(
                "group packet too short: {} bytes, need at least {}",
                data.len(),
                GROUP_PACKET_MIN
            )));
        }

        let source_raw = u16::from(data[0]) << 8 | u16::from(data[1]);
        let dest_raw = u16::from(data[2]) << 8 | u16::from(data[3]);
        // byte 4 is TPCI, 0x00 for group communication
        let apci = Apci::from_byte(data[5])?;

        let payload = if data.len() > GROUP_PACKET_MIN {
            // Long frame: payload follows the header
            data[GROUP_PACKET_MIN..].to_vec()
        } else if matches!(apci, Apci::Write | Apci::Response) {
            // Short frame: value lives in the lower 6 bits of the APCI byte
            vec![data[5] & 0x3F]
        } else {
            Vec::new()
        };

        Ok(Self {
            source: Some(IndividualAddress::from_u16(source_raw)),
            destination: GroupAddress::from_u16(dest_raw),
            apci,
            payload,
            received_at: Utc::now(),
        })
    }

    /// Encode for sending on the daemon's group socket
    ///
    /// The send format carries no source address; the daemon stamps it:
    ///
    /// ```text
    /// short APDU (one byte, value <= 0x3F): GA(2) + [0x00, APCI|value]
    /// long APDU:                            GA(2) + [0x00, APCI] + payload
    /// read request:                         GA(2) + [0x00, 0x00]
    /// ```
    pub fn encode_group_packet(&self) -> Vec<u8> {
        let ga = self.destination.to_u16();
        let small = self.payload.len() == 1 && self.payload[0] <= 0x3F;

        if self.payload.is_empty() || small {
            let mut buf = vec![0u8; 4];
            buf[0] = (ga >> 8) as u8;
            buf[1] = (ga & 0xFF) as u8;
            buf[2] = 0x00; // TPCI
            buf[3] = if small {
                self.apci.to_byte() | (self.payload[0] & 0x3F)
            } else {
                self.apci.to_byte()
            };
            return buf;
        }

        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.push((ga >> 8) as u8);
        buf.push((ga & 0xFF) as u8);
        buf.push(0x00); // TPCI
        buf.push(self.apci.to_byte());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Telegram{{ga: {}, apci: {}, payload: {:02X?}}}",
            self.destination, self.apci, self.payload
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
