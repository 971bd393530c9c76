//! V380 wire framing.
//!
//! Every message on the camera socket looks like
//! `MAGIC(4) | type(1) | length(4, BE) | payload(length) | checksum(2, BE)`.
//! Media payloads carry a 4-byte big-endian sequence marker in front of the
//! codec data; control payloads are UTF-8 JSON; heartbeats are usually empty.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"V380";
pub const HEADER_LEN: usize = 9;
pub const CHECKSUM_LEN: usize = 2;
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;
const SEQUENCE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Video,
    Audio,
    Control,
    Heartbeat,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Video => 0x01,
            MessageKind::Audio => 0x02,
            MessageKind::Control => 0x03,
            MessageKind::Heartbeat => 0x04,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MessageKind::Video),
            0x02 => Some(MessageKind::Audio),
            0x03 => Some(MessageKind::Control),
            0x04 => Some(MessageKind::Heartbeat),
            _ => None,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(self, MessageKind::Video | MessageKind::Audio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self { kind, payload: payload.into() }
    }

    /// Build a media message with its sequence marker prepended.
    pub fn media(kind: MessageKind, sequence: u32, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(SEQUENCE_LEN + data.len());
        payload.put_u32(sequence);
        payload.extend_from_slice(data);
        Self { kind, payload: payload.freeze() }
    }

    pub fn control(value: &serde_json::Value) -> Self {
        Self::new(MessageKind::Control, Bytes::from(value.to_string()))
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, Bytes::new())
    }

    pub fn sequence(&self) -> Option<u32> {
        if !self.kind.is_media() || self.payload.len() < SEQUENCE_LEN {
            return None;
        }
        let mut marker = [0u8; SEQUENCE_LEN];
        marker.copy_from_slice(&self.payload[..SEQUENCE_LEN]);
        Some(u32::from_be_bytes(marker))
    }

    /// Codec data of a media message, without the sequence marker.
    pub fn media_data(&self) -> Bytes {
        if self.sequence().is_some() {
            self.payload.slice(SEQUENCE_LEN..)
        } else {
            self.payload.clone()
        }
    }

    pub fn control_json(&self) -> Option<serde_json::Value> {
        if self.kind != MessageKind::Control {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn encode(&self) -> Bytes {
        encode(self.kind, &self.payload)
    }
}

/// XOR-fold of the payload into 16 bits. Words are big-endian; an odd
/// trailing byte occupies the high half of its word.
pub fn checksum(payload: &[u8]) -> u16 {
    payload.chunks(2).fold(0u16, |acc, chunk| {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => (*hi as u16) << 8,
            _ => 0,
        };
        acc ^ word
    })
}

pub fn encode(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&MAGIC);
    out.put_u8(kind.tag());
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    out.put_u16(checksum(payload));
    out.freeze()
}

/// Recoverable framing problems. The decoder has already resynchronized
/// when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("checksum mismatch on {kind:?} frame (expected {expected:#06x}, got {actual:#06x})")]
    Checksum {
        kind: MessageKind,
        expected: u16,
        actual: u16,
    },

    #[error("unknown message type tag {0:#04x}")]
    UnknownType(u8),

    #[error("declared payload length {0} exceeds limit")]
    Oversized(usize),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    skipped_bytes: u64,
    errors: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop any buffered partial frame; used when a new connection starts.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// Returns the next complete message, a recoverable decode error, or
    /// `None` when more input is needed.
    pub fn next_message(&mut self) -> Option<Result<Message, DecodeError>> {
        if !self.align_to_magic() || self.buf.len() < HEADER_LEN {
            return None;
        }

        let tag = self.buf[4];
        let length = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;

        let Some(kind) = MessageKind::from_tag(tag) else {
            return Some(Err(self.resync(DecodeError::UnknownType(tag))));
        };
        if length > MAX_PAYLOAD {
            return Some(Err(self.resync(DecodeError::Oversized(length))));
        }

        let total = HEADER_LEN + length + CHECKSUM_LEN;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return None;
        }

        let payload_end = HEADER_LEN + length;
        let expected = u16::from_be_bytes([self.buf[payload_end], self.buf[payload_end + 1]]);
        let actual = checksum(&self.buf[HEADER_LEN..payload_end]);
        if expected != actual {
            return Some(Err(self.resync(DecodeError::Checksum { kind, expected, actual })));
        }

        let mut frame = self.buf.split_to(total);
        let _header = frame.split_to(HEADER_LEN);
        frame.truncate(length);
        Some(Ok(Message { kind, payload: frame.freeze() }))
    }

    /// Drains every message currently decodable from the buffer.
    pub fn messages(&mut self) -> impl Iterator<Item = Result<Message, DecodeError>> + '_ {
        std::iter::from_fn(move || self.next_message())
    }

    fn resync(&mut self, error: DecodeError) -> DecodeError {
        // Step past the current magic so the next scan finds the following header.
        let _ = self.buf.split_to(1);
        self.skipped_bytes += 1;
        self.errors += 1;
        error
    }

    fn align_to_magic(&mut self) -> bool {
        if let Some(pos) = find_magic(&self.buf) {
            if pos > 0 {
                let _ = self.buf.split_to(pos);
                self.skipped_bytes += pos as u64;
            }
            return true;
        }

        // Keep a possible partial magic at the tail.
        let keep = (MAGIC.len() - 1).min(self.buf.len());
        let drop = self.buf.len() - keep;
        if drop > 0 {
            let _ = self.buf.split_to(drop);
            self.skipped_bytes += drop as u64;
        }
        false
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}
