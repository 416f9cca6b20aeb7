//! Framing errors

use korelink_core::{KoreError, MessageId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Unknown message identifier {0}")]
    UnknownMessage(MessageId),

    #[error("Invalid declared length {length} for {id}")]
    InvalidLength { id: MessageId, length: usize },

    #[error("Identifier {0} did not de-obfuscate to a known message")]
    CipherDesync(MessageId),
}

impl From<FramingError> for KoreError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::CipherDesync(_) => KoreError::CipherDesync(err.to_string()),
            _ => KoreError::Framing(err.to_string()),
        }
    }
}
