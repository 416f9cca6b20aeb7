//! Frame assembly
//!
//! [`FrameAssembler`] turns an arbitrary byte stream into complete frames.
//! Bytes are fed as they arrive; frames come out through a lazy iterator that
//! only ever moves forward. A frame is emitted only once every byte its length
//! rule requires has arrived.
//!
//! When the stream's identifiers are obfuscated, the leading identifier is
//! de-obfuscated exactly once and remembered until its frame completes, so a
//! frame that arrives in pieces advances the key a single time.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use korelink_core::MessageId;
use tracing::{trace, warn};

use crate::cipher::MessageCipher;
use crate::error::FramingError;
use crate::frame::Frame;
use crate::registry::Registry;
use crate::schema::LengthRule;

/// What to do when the stream cannot be framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingPolicy {
    /// Report the error and stop producing frames until reset
    #[default]
    Disconnect,
    /// Discard one byte and rescan (plaintext streams only)
    Resync,
}

/// Accumulates bytes and splits them into frames
pub struct FrameAssembler {
    registry: Arc<Registry>,
    policy: FramingPolicy,
    buffer: BytesMut,

    /// True identifier of the frame at the head of the buffer
    pending_id: Option<MessageId>,
    poisoned: bool,

    frames: u64,
    discarded: u64,
}

impl FrameAssembler {
    pub fn new(registry: Arc<Registry>, policy: FramingPolicy) -> Self {
        Self {
            registry,
            policy,
            buffer: BytesMut::with_capacity(4096),
            pending_id: None,
            poisoned: false,
            frames: 0,
            discarded: 0,
        }
    }

    /// Append plaintext stream bytes and iterate over the completed frames
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);
        Frames {
            assembler: self,
            cipher: None,
        }
    }

    /// Append bytes whose identifiers are obfuscated under `cipher`
    pub fn feed_ciphered<'a>(
        &'a mut self,
        data: &[u8],
        cipher: &'a mut MessageCipher,
    ) -> Frames<'a> {
        self.buffer.extend_from_slice(data);
        Frames {
            assembler: self,
            cipher: Some(cipher),
        }
    }

    /// Append stream bytes without framing them yet
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take one completed frame, deciphering its identifier with `cipher`
    ///
    /// The identifier is only deciphered when the frame is taken, so the
    /// caller may activate or reseed `cipher` between two frames of the
    /// same read.
    pub fn next_ciphered(
        &mut self,
        cipher: &mut MessageCipher,
    ) -> Option<Result<Frame, FramingError>> {
        self.next_frame(Some(cipher))
    }

    /// Drop any partially assembled bytes and clear a previous failure
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_id = None;
        self.poisoned = false;
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Frames emitted since creation
    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    /// Bytes skipped while resynchronizing
    pub fn bytes_discarded(&self) -> u64 {
        self.discarded
    }

    fn next_frame(
        &mut self,
        mut cipher: Option<&mut MessageCipher>,
    ) -> Option<Result<Frame, FramingError>> {
        loop {
            if self.poisoned || self.buffer.len() < 2 {
                return None;
            }

            let id = match self.pending_id {
                Some(id) => id,
                None => {
                    let wire = MessageId(u16::from_le_bytes([self.buffer[0], self.buffer[1]]));
                    let id = match cipher.as_deref_mut() {
                        Some(c) => c.decrypt(wire),
                        None => wire,
                    };
                    self.pending_id = Some(id);
                    id
                }
            };
            let ciphered = cipher.as_ref().map(|c| c.is_active()).unwrap_or(false);

            let total = match self.registry.schema(id).map(|s| s.length) {
                Some(LengthRule::Fixed(n)) => n,
                Some(LengthRule::Variable) => {
                    if self.buffer.len() < 4 {
                        return None;
                    }
                    let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
                    if length < 4 {
                        match self.fail(FramingError::InvalidLength { id, length }, ciphered) {
                            Some(err) => return Some(Err(err)),
                            None => continue,
                        }
                    }
                    length
                }
                None => {
                    let err = if ciphered {
                        FramingError::CipherDesync(id)
                    } else {
                        FramingError::UnknownMessage(id)
                    };
                    match self.fail(err, ciphered) {
                        Some(err) => return Some(Err(err)),
                        None => continue,
                    }
                }
            };

            if self.buffer.len() < total {
                return None;
            }

            let mut raw = self.buffer.split_to(total).freeze();
            raw.advance(2);
            self.pending_id = None;
            self.frames += 1;
            trace!("Framed {} ({} bytes)", id, total);
            return Some(Ok(Frame::new(id, raw)));
        }
    }

    /// Apply the framing policy; returns the error when the stream must stop
    fn fail(&mut self, err: FramingError, ciphered: bool) -> Option<FramingError> {
        self.pending_id = None;
        if ciphered || self.policy == FramingPolicy::Disconnect {
            self.poisoned = true;
            return Some(err);
        }
        warn!("{}; discarding one byte to resynchronize", err);
        self.buffer.advance(1);
        self.discarded += 1;
        None
    }
}

/// Lazy, forward-only sequence of frames
///
/// Dropping the iterator early leaves the remaining bytes buffered; they are
/// framed on the next feed.
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
    cipher: Option<&'a mut MessageCipher>,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.assembler.next_frame(self.cipher.as_deref_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherProfile;
    use crate::message_ids;

    static SYSTEM_CHAT: [u8; 7] = [0x9A, 0x00, 0x09, 0x00, 0x68, 0x69, 0x00];

    fn assembler(policy: FramingPolicy) -> FrameAssembler {
        FrameAssembler::new(Arc::new(Registry::builtin()), policy)
    }

    fn collect(frames: Frames<'_>) -> Vec<Frame> {
        frames.map(|f| f.unwrap()).collect()
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SYSTEM_CHAT);
        // sync
        stream.extend_from_slice(&[0x7E, 0x00, 0x01, 0x02, 0x03, 0x04]);
        // map_loaded_ack
        stream.extend_from_slice(&[0x7D, 0x00]);
        // stat_info
        stream.extend_from_slice(&[0xB0, 0x00, 0x05, 0x00, 0x10, 0x00, 0x00, 0x00]);
        stream.extend_from_slice(&SYSTEM_CHAT);
        stream
    }

    #[test]
    fn test_system_chat_vector_under_every_split() {
        for split in 0..=SYSTEM_CHAT.len() {
            let mut asm = assembler(FramingPolicy::Disconnect);
            let mut frames = collect(asm.feed(&SYSTEM_CHAT[..split]));
            frames.extend(collect(asm.feed(&SYSTEM_CHAT[split..])));

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0].id, message_ids::SYSTEM_CHAT);
            assert_eq!(frames[0].payload.len(), 5);
            assert_eq!(&frames[0].payload[..], &SYSTEM_CHAT[2..]);
            assert_eq!(asm.buffered(), 0);
        }
    }

    #[test]
    fn test_split_at_every_boundary_matches_single_feed() {
        let stream = sample_stream();
        let expected = collect(assembler(FramingPolicy::Disconnect).feed(&stream));
        assert_eq!(expected.len(), 5);

        for split in 0..=stream.len() {
            let mut asm = assembler(FramingPolicy::Disconnect);
            let mut frames = collect(asm.feed(&stream[..split]));
            frames.extend(collect(asm.feed(&stream[split..])));
            assert_eq!(frames, expected, "split at {}", split);
        }

        let mut asm = assembler(FramingPolicy::Disconnect);
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(collect(asm.feed(std::slice::from_ref(byte))));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_partial_frame_is_never_emitted() {
        let mut asm = assembler(FramingPolicy::Disconnect);
        assert!(asm.feed(&SYSTEM_CHAT[..6]).next().is_none());
        assert_eq!(asm.buffered(), 6);
        assert_eq!(asm.frames_emitted(), 0);
    }

    #[test]
    fn test_dropped_iterator_keeps_remaining_frames() {
        let mut asm = assembler(FramingPolicy::Disconnect);
        let stream = sample_stream();
        let first = asm.feed(&stream).next().unwrap().unwrap();
        assert_eq!(first.id, message_ids::SYSTEM_CHAT);

        let rest = collect(asm.feed(&[]));
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].id, message_ids::SYNC);
    }

    #[test]
    fn test_unknown_identifier_poisons_under_disconnect() {
        let mut asm = assembler(FramingPolicy::Disconnect);
        let mut frames = asm.feed(&[0xFF, 0x0F, 0x7D, 0x00]);
        assert_eq!(
            frames.next(),
            Some(Err(FramingError::UnknownMessage(MessageId(0x0FFF))))
        );
        assert!(frames.next().is_none());
        assert!(asm.is_poisoned());

        asm.reset();
        let frames = collect(asm.feed(&[0x7D, 0x00]));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_unknown_identifier_resyncs() {
        let mut asm = assembler(FramingPolicy::Resync);
        let mut stream = vec![0xFF];
        stream.extend_from_slice(&SYSTEM_CHAT);
        let frames = collect(asm.feed(&stream));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, message_ids::SYSTEM_CHAT);
        assert_eq!(asm.bytes_discarded(), 1);
    }

    #[test]
    fn test_short_declared_length_is_invalid() {
        let mut asm = assembler(FramingPolicy::Disconnect);
        let result = asm.feed(&[0x9A, 0x00, 0x03, 0x00]).next();
        assert_eq!(
            result,
            Some(Err(FramingError::InvalidLength {
                id: message_ids::SYSTEM_CHAT,
                length: 3
            }))
        );
    }

    #[test]
    fn test_ciphered_stream_advances_once_per_frame() {
        let profile = CipherProfile::ThreeKey {
            k1: 0x0100_0000,
            k2: 1,
            k3: 3,
            reseed_message: None,
        };
        let mut sender = MessageCipher::new(profile.clone());
        let mut receiver = MessageCipher::new(profile);
        sender.activate();
        receiver.activate();

        let plain = [
            Frame::new(message_ids::SYSTEM_CHAT, &SYSTEM_CHAT[2..]),
            Frame::new(message_ids::SYNC, vec![1, 2, 3, 4]),
            Frame::empty(message_ids::MAP_LOADED_ACK),
        ];
        let mut wire = Vec::new();
        for frame in &plain {
            let id = sender.encrypt(frame.id);
            wire.extend_from_slice(&frame.encode_with(id));
        }

        let mut asm = assembler(FramingPolicy::Disconnect);
        let mut frames = Vec::new();
        for byte in &wire {
            let chunk = std::slice::from_ref(byte);
            frames.extend(asm.feed_ciphered(chunk, &mut receiver).map(|f| f.unwrap()));
        }
        assert_eq!(frames, plain);
        assert_eq!(receiver.advances(), 3);
        assert_eq!(receiver.state(), sender.state());
    }

    #[test]
    fn test_cipher_switched_on_between_frames() {
        let profile = CipherProfile::ThreeKey {
            k1: 0x0100_0000,
            k2: 1,
            k3: 3,
            reseed_message: None,
        };
        let mut sender = MessageCipher::new(profile.clone());
        let mut receiver = MessageCipher::new(profile);

        // A plaintext frame and a ciphered one arrive in the same read
        let mut wire = SYSTEM_CHAT.to_vec();
        sender.activate();
        let ack = Frame::empty(message_ids::MAP_LOADED_ACK);
        wire.extend_from_slice(&ack.encode_with(sender.encrypt(ack.id)));

        let mut asm = assembler(FramingPolicy::Disconnect);
        asm.push(&wire);
        let first = asm.next_ciphered(&mut receiver).unwrap().unwrap();
        assert_eq!(first.id, message_ids::SYSTEM_CHAT);
        assert_eq!(receiver.advances(), 0);

        receiver.activate();
        let second = asm.next_ciphered(&mut receiver).unwrap().unwrap();
        assert_eq!(second, ack);
        assert!(asm.next_ciphered(&mut receiver).is_none());
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_ciphered_stream_never_resyncs() {
        let profile = CipherProfile::ThreeKey {
            k1: 0x0100_0000,
            k2: 1,
            k3: 3,
            reseed_message: None,
        };
        let mut receiver = MessageCipher::new(profile);
        receiver.activate();

        let mut asm = assembler(FramingPolicy::Resync);
        // 0x0064 sent in plaintext decrypts to 0x0364, which is unknown
        let result = asm.feed_ciphered(&[0x64, 0x00], &mut receiver).next();
        assert_eq!(result, Some(Err(FramingError::CipherDesync(MessageId(0x0364)))));
        assert!(asm.is_poisoned());
        assert_eq!(asm.bytes_discarded(), 0);
    }
}
