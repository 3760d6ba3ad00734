//! Heart-beat pulse wire format.
//!
//! Fixed 16-byte little-endian record sent over the signaller's UDP
//! channel: `{u32 client_id, u32 seq, i64 timestamp_ns}`.

use crate::status::Status;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub const HEART_BEAT_WIRE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub client_id: u32,
    pub seq: u32,
    pub timestamp_ns: i64,
}

impl HeartBeat {
    pub fn encode(&self) -> [u8; HEART_BEAT_WIRE_LEN] {
        let mut buf = [0u8; HEART_BEAT_WIRE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.client_id);
        LittleEndian::write_u32(&mut buf[4..8], self.seq);
        LittleEndian::write_i64(&mut buf[8..16], self.timestamp_ns);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<HeartBeat, Status> {
        if bytes.len() != HEART_BEAT_WIRE_LEN {
            return Err(Status::data_loss(format!(
                "heart-beat frame must be {HEART_BEAT_WIRE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(HeartBeat {
            client_id: LittleEndian::read_u32(&bytes[0..4]),
            seq: LittleEndian::read_u32(&bytes[4..8]),
            timestamp_ns: LittleEndian::read_i64(&bytes[8..16]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let hb = HeartBeat {
            client_id: 42,
            seq: 7,
            timestamp_ns: 1_234_567_890_123,
        };
        let decoded = HeartBeat::decode(&hb.encode()).unwrap();
        assert_eq!(decoded, hb);
    }

    #[test]
    fn encode_is_little_endian() {
        let hb = HeartBeat {
            client_id: 1,
            seq: 0x0102_0304,
            timestamp_ns: 0,
        };
        let bytes = hb.encode();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
    }

    #[test]
    fn short_frame_rejected() {
        assert!(HeartBeat::decode(&[0u8; 8]).is_err());
    }
}
