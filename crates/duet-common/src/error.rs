//! Common error types for Duet.

use thiserror::Error;

/// Result type alias using Duet's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Duet operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, device)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid construction parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation attempted after the component was stopped
    #[error("closed: {0}")]
    Closed(String),

    /// Malformed encoded payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Internal invariant violated; the component must not be used further
    #[error("corruption: {0}")]
    Corruption(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a closed error from any displayable type.
    pub fn closed(msg: impl std::fmt::Display) -> Self {
        Self::Closed(msg.to_string())
    }

    /// Create a decode error from any displayable type.
    pub fn decode(msg: impl std::fmt::Display) -> Self {
        Self::Decode(msg.to_string())
    }

    /// Create a corruption error from any displayable type.
    pub fn corruption(msg: impl std::fmt::Display) -> Self {
        Self::Corruption(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether the error leaves the component unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_fatal() {
        assert!(Error::corruption("queue length 3, expected 5").is_fatal());
        assert!(!Error::decode("bad toc byte").is_fatal());
        assert!(!Error::closed("jitter buffer").is_fatal());
    }

    #[test]
    fn closed_is_detected() {
        assert!(Error::closed("jitter buffer").is_closed());
        assert!(!Error::config("frame size").is_closed());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: pipe");
    }
}
