//! Wire frame header.
//!
//! Every message on a stream channel is preceded by this fixed 8-byte
//! prefix: bytes 0-3 payload length (little-endian u32), bytes 4-7
//! reserved and must be zero.

use byteorder::{ByteOrder, LittleEndian};
use felix_protocol::Status;

pub const HEADER_LEN: usize = 8;

/// Upper bound a channel will accept for one frame's payload.  A peer
/// declaring anything larger is treated as corrupt and disconnected.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    payload_len: u32,
}

impl Header {
    pub fn new(payload_len: u32) -> Self {
        Header { payload_len }
    }

    pub fn payload_len(self) -> u32 {
        self.payload_len
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], self.payload_len);
        bytes
    }

    /// Decode and validate against `max_len`.  Non-zero reserved bytes or
    /// an oversized declared length both classify as a corrupted header.
    pub fn decode(bytes: &[u8; HEADER_LEN], max_len: u32) -> Result<Header, Status> {
        let payload_len = LittleEndian::read_u32(&bytes[0..4]);
        if bytes[4..8] != [0, 0, 0, 0] {
            return Err(Status::new(
                felix_protocol::StatusCode::CorruptedHeader,
                "reserved header bytes are non-zero",
            ));
        }
        if payload_len > max_len {
            return Err(Status::new(
                felix_protocol::StatusCode::CorruptedHeader,
                format!("declared payload length {payload_len} exceeds maximum {max_len}"),
            ));
        }
        Ok(Header { payload_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = Header::new(1234);
        let decoded = Header::decode(&header.encode(), MAX_FRAME_LEN).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let mut bytes = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], u32::MAX);
        let err = Header::decode(&bytes, MAX_FRAME_LEN).unwrap_err();
        assert_eq!(err.code, felix_protocol::StatusCode::CorruptedHeader);
    }

    #[test]
    fn nonzero_reserved_is_corrupt() {
        let mut bytes = Header::new(4).encode();
        bytes[5] = 1;
        let err = Header::decode(&bytes, MAX_FRAME_LEN).unwrap_err();
        assert_eq!(err.code, felix_protocol::StatusCode::CorruptedHeader);
    }
}
