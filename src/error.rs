//! Error types for the shroud transport.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for shroud operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the transport stack.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed (encryption, decryption, authentication)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Possible replay attack detected
    #[error("found possible replay attack from {0}")]
    Replay(SocketAddr),

    /// Wire data violated the protocol (bad tag, size mismatch, bad padding)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Session ID 0 is reserved and never valid on the wire
    #[error("reserved session ID 0 is used")]
    ReservedSessionId,

    /// No session registered under this ID
    #[error("session {0} is not found")]
    SessionNotFound(u32),

    /// Operation received by the wrong role (e.g. a client got an open request)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer underflow/overflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Operation timed out
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The underlay or session is already closed
    #[error("transport is closed")]
    Closed,

    /// Client config was never stored
    #[error("no client config")]
    NoClientConfig,

    /// Client is not running
    #[error("client is not running")]
    NotRunning,

    /// Client config can't change after start
    #[error("can't store client config after start")]
    StoreAfterStart,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid-operation error
    pub fn invalid_op(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Check if this error indicates an authentication or replay failure.
    pub fn is_security_failure(&self) -> bool {
        matches!(self, Error::Crypto(_) | Error::Replay(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ReservedSessionId;
        assert_eq!(err.to_string(), "reserved session ID 0 is used");

        let err = Error::SessionNotFound(42);
        assert_eq!(err.to_string(), "session 42 is not found");

        let err = Error::Buffer {
            expected: 32,
            actual: 7,
        };
        assert_eq!(err.to_string(), "buffer error: expected 32 bytes, got 7");
    }

    #[test]
    fn test_security_failure() {
        assert!(Error::crypto("bad tag").is_security_failure());
        assert!(Error::Replay("127.0.0.1:1".parse().unwrap()).is_security_failure());
        assert!(!Error::NotRunning.is_security_failure());
    }
}
