//! Frame assembly and parsing.
//!
//! `serialize_to_buffer` / `jsonize_to_buffer` encode a header followed by
//! the payload into a [`FrameBuffer`].  A fixed-capacity buffer that is too
//! small reports the required size so the caller can grow and retry; a
//! dynamic buffer grows on its own.

use crate::header::{Header, HEADER_LEN, MAX_FRAME_LEN};
use felix_protocol::{Status, StatusCode};
use serde::Serialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageIoError {
    #[error("failed to serialize message")]
    FailedToSerialize,
    #[error("buffer too small, {required} bytes required")]
    NotEnoughBuffer { required: usize },
    #[error("corrupted frame header")]
    CorruptedHeader,
    #[error("failed to parse message")]
    FailedToParse,
}

impl From<MessageIoError> for Status {
    fn from(e: MessageIoError) -> Status {
        let code = match e {
            MessageIoError::FailedToSerialize => StatusCode::FailedToSerialize,
            MessageIoError::NotEnoughBuffer { .. } => StatusCode::NotEnoughBuffer,
            MessageIoError::CorruptedHeader => StatusCode::CorruptedHeader,
            MessageIoError::FailedToParse => StatusCode::FailedToParse,
        };
        Status::new(code, e.to_string())
    }
}

/// Destination buffer for frame assembly.
///
/// In fixed mode the capacity never changes and oversized frames are
/// refused; in dynamic mode the buffer grows to whatever the frame needs.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    dynamic: bool,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        FrameBuffer {
            bytes: Vec::with_capacity(capacity),
            capacity,
            dynamic: false,
        }
    }

    pub fn set_dynamic(&mut self, dynamic: bool) {
        self.dynamic = dynamic;
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow a fixed buffer; the caller decides to do this after a
    /// `NotEnoughBuffer` error.
    pub fn resize_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// The assembled frame from the last successful encode.
    pub fn frame(&self) -> &[u8] {
        &self.bytes
    }

    fn ensure(&mut self, required: usize) -> Result<(), MessageIoError> {
        if required > self.capacity {
            if !self.dynamic {
                return Err(MessageIoError::NotEnoughBuffer { required });
            }
            self.capacity = required;
        }
        Ok(())
    }

    fn fill(&mut self, payload: &[u8]) {
        self.bytes.clear();
        self.bytes.reserve(HEADER_LEN + payload.len());
        let header = Header::new(payload.len() as u32);
        self.bytes.extend_from_slice(&header.encode());
        self.bytes.extend_from_slice(payload);
    }
}

/// Encode `<Header><payload>` into `buffer`.  Returns the frame length.
pub fn serialize_to_buffer(
    payload: &[u8],
    buffer: &mut FrameBuffer,
) -> Result<usize, MessageIoError> {
    if payload.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(MessageIoError::FailedToSerialize);
    }
    let required = HEADER_LEN + payload.len();
    buffer.ensure(required)?;
    buffer.fill(payload);
    Ok(required)
}

/// Encode a message as its JSON rendering, framed like any other payload.
/// Opt-in per publisher, for debugging and WS clients.
pub fn jsonize_to_buffer<T: Serialize>(
    message: &T,
    buffer: &mut FrameBuffer,
) -> Result<usize, MessageIoError> {
    let text = serde_json::to_vec(message).map_err(|_| MessageIoError::FailedToSerialize)?;
    serialize_to_buffer(&text, buffer)
}

/// Parse the header at the front of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<Header, MessageIoError> {
    let header_bytes: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(MessageIoError::CorruptedHeader)?;
    Header::decode(header_bytes, MAX_FRAME_LEN).map_err(|_| MessageIoError::CorruptedHeader)
}

/// Extract the payload of a frame whose header has already been parsed.
/// `bytes` must contain the full frame including the header.
pub fn parse_payload(bytes: &[u8], header: Header) -> Result<&[u8], MessageIoError> {
    let end = HEADER_LEN + header.payload_len() as usize;
    bytes.get(HEADER_LEN..end).ok_or(MessageIoError::CorruptedHeader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trip() {
        let payload = b"hello\0";
        let mut buffer = FrameBuffer::with_capacity(64);
        let len = serialize_to_buffer(payload, &mut buffer).unwrap();
        assert_eq!(len, HEADER_LEN + payload.len());
        assert_eq!(buffer.frame().len(), len);

        let header = parse_header(buffer.frame()).unwrap();
        assert_eq!(header.payload_len() as usize, payload.len());
        assert_eq!(parse_payload(buffer.frame(), header).unwrap(), payload);
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut buffer = FrameBuffer::with_capacity(HEADER_LEN);
        serialize_to_buffer(b"", &mut buffer).unwrap();
        let header = parse_header(buffer.frame()).unwrap();
        assert_eq!(header.payload_len(), 0);
        assert!(parse_payload(buffer.frame(), header).unwrap().is_empty());
    }

    #[test]
    fn fixed_buffer_reports_required_size() {
        let payload = vec![0xAB; 2 * 1024 * 1024];
        let mut buffer = FrameBuffer::with_capacity(64 * 1024);
        let err = serialize_to_buffer(&payload, &mut buffer).unwrap_err();
        assert_eq!(
            err,
            MessageIoError::NotEnoughBuffer {
                required: HEADER_LEN + payload.len()
            }
        );

        // Grow and retry, as the dynamic-buffer path does.
        buffer.resize_capacity(HEADER_LEN + payload.len());
        let len = serialize_to_buffer(&payload, &mut buffer).unwrap();
        assert_eq!(len, HEADER_LEN + payload.len());
    }

    #[test]
    fn dynamic_buffer_grows_on_demand() {
        let payload = vec![1u8; 1024];
        let mut buffer = FrameBuffer::with_capacity(16);
        buffer.set_dynamic(true);
        serialize_to_buffer(&payload, &mut buffer).unwrap();
        assert!(buffer.capacity() >= HEADER_LEN + payload.len());
    }

    #[test]
    fn jsonize_produces_parseable_text() {
        #[derive(serde::Serialize)]
        struct Sample {
            x: u32,
        }
        let mut buffer = FrameBuffer::with_capacity(64);
        jsonize_to_buffer(&Sample { x: 3 }, &mut buffer).unwrap();
        let header = parse_header(buffer.frame()).unwrap();
        let payload = parse_payload(buffer.frame(), header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["x"], 3);
    }
}
