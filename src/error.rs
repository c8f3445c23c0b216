//! Error types for the hopping tunnel.

use std::net::IpAddr;

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while deriving ports, admitting peers or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is invalid; the route must not start
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared secret could not be decoded
    #[error("invalid shared secret: {0}")]
    Secret(String),

    /// Token did not match the expected HMAC
    #[error("authentication failed")]
    Authentication,

    /// Declared step is outside the skew tolerance
    #[error("step {declared} outside skew tolerance (current step {current})")]
    StepSkew {
        /// Step carried in the handshake header
        declared: i64,
        /// Step of the verifier at verification time
        current: i64,
    },

    /// Handshake framing error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A hop port could not be bound
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Port that failed to bind
        port: u16,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Every candidate port of the window refused the connection
    #[error("no reachable port on {host} after {attempts} attempts")]
    DialExhausted {
        /// Remote host that was dialed
        host: String,
        /// Number of candidates tried
        attempts: usize,
    },

    /// Peer address is not in the allowed origin list
    #[error("origin {0} not allowed")]
    OriginRejected(IpAddr),

    /// Peer exceeded the handshake failure budget
    #[error("origin {0} throttled")]
    Throttled(IpAddr),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new secret decoding error
    pub fn secret(msg: impl Into<String>) -> Self {
        Error::Secret(msg.into())
    }

    /// Check if this error only affects a single flow
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::DialExhausted { .. } | Error::Network(_)
        ) || self.is_admission_failure()
    }

    /// Check if this error is a rejected handshake
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Error::Authentication
                | Error::StepSkew { .. }
                | Error::Handshake(_)
                | Error::Buffer { .. }
                | Error::OriginRejected(_)
                | Error::Throttled(_)
        )
    }
}
