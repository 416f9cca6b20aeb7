//! Core error types for korelink
//!
//! The variants mirror how each failure is recovered:
//! - `Framing` / `CipherDesync` on the upstream path force a full session reset
//! - `Connection` / `Timeout` go through the bounded retry path
//! - `ProtocolViolation` only ever closes the offending mirrored client
//! - `Configuration` is fatal and surfaced to the operator

#[derive(thiserror::Error, Debug)]
pub enum KoreError {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Cipher desync: {0}")]
    CipherDesync(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl KoreError {
    /// Whether this error must tear the upstream session all the way down to
    /// `Disconnected` rather than being retried in place.
    pub fn forces_reset(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::CipherDesync(_))
    }

    /// Whether the bounded retry path may recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, KoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(KoreError::Framing("bad id".into()).forces_reset());
        assert!(KoreError::CipherDesync("drift".into()).forces_reset());
        assert!(!KoreError::Connection("refused".into()).forces_reset());

        assert!(KoreError::Timeout("master".into()).is_retryable());
        assert!(!KoreError::Configuration("no master".into()).is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: KoreError = io.into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("reset"));
    }
}
