//! Frame codec: 4-byte big-endian length prefix around UTF-8 JSON.
//!
//! The length refers to the JSON body only. Frames above 1 MiB, empty
//! frames, and malformed JSON are protocol violations that close the
//! offending connection.

use thiserror::Error;

use super::wire::Message;

/// Hard ceiling on a single frame body.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Width of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the 1 MiB ceiling")]
    FrameTooLarge(usize),

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame body is not a JSON object")]
    NotAnObject,

    #[error("message is missing the numeric `type` field")]
    MissingType,

    #[error("unknown message type code 0x{0:02X}")]
    UnknownType(u8),
}

/// Encode one message into a length-prefixed frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(&message.to_value()?)?;
    if body.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    if body.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame reassembly buffer for one connection.
///
/// Bytes are appended as they arrive; `decode_all` drains every complete
/// frame and leaves a partial tail in place for the next read.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered (prefix and partial frames included).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain all complete frames. A violation (oversized/empty frame, bad
    /// JSON, unknown type) aborts immediately; the connection owning this
    /// buffer must be closed.
    pub fn decode_all(&mut self) -> Result<Vec<Message>, CodecError> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < LENGTH_PREFIX_BYTES {
                break;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len == 0 {
                return Err(CodecError::EmptyFrame);
            }
            if len > MAX_FRAME_BYTES {
                return Err(CodecError::FrameTooLarge(len));
            }
            if self.buf.len() < LENGTH_PREFIX_BYTES + len {
                break;
            }
            let body: Vec<u8> = self.buf.drain(..LENGTH_PREFIX_BYTES + len).skip(LENGTH_PREFIX_BYTES).collect();
            let value: serde_json::Value = serde_json::from_slice(&body)?;
            out.push(Message::from_value(value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NodeId;
    use crate::mesh::wire::{ElectionNotice, Ping};

    fn ping(ts: i64) -> Message {
        Message::Ping(Ping { node_id: NodeId::from_string("aaaa"), timestamp: ts })
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = ping(42);
        let mut buf = FrameBuffer::new();
        buf.extend(&encode(&msg).unwrap());
        let decoded = buf.decode_all().unwrap();
        assert_eq!(decoded, vec![msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_plus_partial_tail() {
        let a = ping(1);
        let b = Message::ElectionVictory(ElectionNotice {
            node_id: NodeId::from_string("bbbb"),
            lamport_ts: 9,
        });
        let c = ping(3);

        let mut stream = encode(&a).unwrap();
        stream.extend(encode(&b).unwrap());
        let c_frame = encode(&c).unwrap();
        let split = c_frame.len() / 2;
        stream.extend(&c_frame[..split]);

        let mut buf = FrameBuffer::new();
        buf.extend(&stream);
        let decoded = buf.decode_all().unwrap();
        assert_eq!(decoded, vec![a, b]);
        assert_eq!(buf.len(), split);

        // Feeding the rest completes the third frame.
        buf.extend(&c_frame[split..]);
        assert_eq!(buf.decode_all().unwrap(), vec![c]);
    }

    #[test]
    fn zero_length_frame_rejected() {
        let mut buf = FrameBuffer::new();
        buf.extend(&0u32.to_be_bytes());
        assert!(matches!(buf.decode_all(), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = FrameBuffer::new();
        #[allow(clippy::cast_possible_truncation)]
        buf.extend(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        buf.extend(&[0u8; 16]);
        assert!(matches!(buf.decode_all(), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn garbage_json_rejected() {
        let body = b"not json at all";
        let mut buf = FrameBuffer::new();
        #[allow(clippy::cast_possible_truncation)]
        buf.extend(&(body.len() as u32).to_be_bytes());
        buf.extend(body);
        assert!(matches!(buf.decode_all(), Err(CodecError::Json(_))));
    }

    #[test]
    fn prefix_only_is_not_an_error() {
        let mut buf = FrameBuffer::new();
        buf.extend(&[0x00, 0x00]);
        assert!(buf.decode_all().unwrap().is_empty());
        assert_eq!(buf.len(), 2);
    }
}
