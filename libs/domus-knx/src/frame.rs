//! Daemon wire message framing
//!
//! The bus daemon speaks a size-prefixed message format over its TCP or
//! unix socket:
//!
//! ```text
//! byte 0-1: size (big endian) = type(2) + payload length
//!           (does NOT include the size field itself)
//! byte 2-3: message type (big endian)
//! byte 4+:  payload
//! ```

use crate::error::{KnxError, Result};

/// Opens a group socket for bidirectional group communication
pub const MSG_OPEN_GROUP_CON: u16 = 0x0026;
/// Carries a group telegram in either direction
pub const MSG_GROUP_PACKET: u16 = 0x0027;
/// Closes the daemon connection gracefully
pub const MSG_CLOSE: u16 = 0x0006;

/// Header size on the wire: size field (2) + type field (2)
pub const FRAME_HEADER: usize = 4;

/// Wrap a payload in the daemon message format
pub fn encode_frame(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let size = 2 + payload.len(); // type(2) + payload, excludes the size field
    let mut buf = Vec::with_capacity(FRAME_HEADER + payload.len());
    buf.push((size >> 8) as u8);
    buf.push((size & 0xFF) as u8);
    buf.push((msg_type >> 8) as u8);
    buf.push((msg_type & 0xFF) as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Parse a complete daemon message
///
/// Returns the message type and a slice over the payload. The caller is
/// responsible for having read exactly one message off the socket (the
/// size field tells it how much to read after the first two bytes).
pub fn parse_frame(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < FRAME_HEADER {
        return Err(KnxError::invalid_frame(format!(
            "message too short: {} bytes",
            data.len()
        )));
    }

    let declared = usize::from(u16::from(data[0]) << 8 | u16::from(data[1]));
    let actual = data.len() - 2; // everything after the size field
    if declared != actual {
        return Err(KnxError::invalid_frame(format!(
            "size mismatch: declared {}, got {}",
            declared, actual
        )));
    }

    let msg_type = u16::from(data[2]) << 8 | u16::from(data[3]);
    Ok((msg_type, &data[FRAME_HEADER..]))
}

/// The group-socket open request payload: write_only = false
///
/// Format after the type field: reserved(1) + write_only(1) + reserved(1)
pub fn open_group_con() -> Vec<u8> {
    encode_frame(MSG_OPEN_GROUP_CON, &[0x00, 0x00, 0x00])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(MSG_GROUP_PACKET, &[0x0A, 0x03, 0x00, 0x81]);
        assert_eq!(frame[0..2], [0x00, 0x06]); // type(2) + payload(4)
        let (msg_type, payload) = parse_frame(&frame).unwrap();
        assert_eq!(msg_type, MSG_GROUP_PACKET);
        assert_eq!(payload, &[0x0A, 0x03, 0x00, 0x81]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = encode_frame(MSG_CLOSE, &[]);
        assert_eq!(frame, vec![0x00, 0x02, 0x00, 0x06]);
        let (msg_type, payload) = parse_frame(&frame).unwrap();
        assert_eq!(msg_type, MSG_CLOSE);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut frame = encode_frame(MSG_GROUP_PACKET, &[0x01, 0x02]);
        frame[1] += 1; // corrupt the size field
        assert!(matches!(
            parse_frame(&frame),
            Err(KnxError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(parse_frame(&[0x00]).is_err());
    }

    #[test]
    fn test_open_group_con_shape() {
        let frame = open_group_con();
        let (msg_type, payload) = parse_frame(&frame).unwrap();
        assert_eq!(msg_type, MSG_OPEN_GROUP_CON);
        assert_eq!(payload, &[0x00, 0x00, 0x00]);
    }
}
