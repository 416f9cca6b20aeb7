//! # Frames
//!
//! A frame is one complete protocol message as it appears on the wire:
//!
//! ```text
//! {u16 LE identifier}{payload}
//! ```
//!
//! For variable-length messages the payload starts with the u16 LE length
//! field, which counts the identifier, the length field itself and the rest
//! of the payload. The frame keeps that field as part of its payload so that
//! relaying a frame never needs to recompute it.

use bytes::{BufMut, Bytes, BytesMut};
use korelink_core::MessageId;

/// One complete protocol message with its true (de-obfuscated) identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// True message identifier
    pub id: MessageId,

    /// Every byte after the identifier
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (two bytes on the wire)
    #[inline]
    pub fn empty(id: MessageId) -> Self {
        Self::new(id, Bytes::new())
    }

    /// Total size on the wire, identifier included
    pub fn wire_len(&self) -> usize {
        2 + self.payload.len()
    }

    /// Serialize with the true identifier
    pub fn to_bytes(&self) -> Bytes {
        self.encode_with(self.id)
    }

    /// Serialize with `wire_id` in place of the true identifier
    ///
    /// This is the only place an obfuscated identifier meets the payload; the
    /// caller ciphers the identifier immediately before transmission.
    pub fn encode_with(&self, wire_id: MessageId) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut buf, wire_id);
        buf.freeze()
    }

    /// Append the wire form to `buf` using `wire_id` as the identifier
    pub fn write_to(&self, buf: &mut BytesMut, wire_id: MessageId) {
        buf.put_u16_le(wire_id.get());
        buf.put_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_form() {
        let frame = Frame::new(MessageId(0x009A), &b"\x09\x00hi\x00"[..]);
        assert_eq!(frame.wire_len(), 7);
        assert_eq!(&frame.to_bytes()[..], &[0x9A, 0x00, 0x09, 0x00, b'h', b'i', 0x00]);
    }

    #[test]
    fn test_encode_with_only_touches_identifier() {
        let frame = Frame::new(MessageId(0x0064), vec![1, 2, 3]);
        let wire = frame.encode_with(MessageId(0x0364));
        assert_eq!(&wire[..2], &[0x64, 0x03]);
        assert_eq!(&wire[2..], &[1, 2, 3]);
    }
}
