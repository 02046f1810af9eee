//! Relay error taxonomy.
//!
//! Every failure the relay layer reports falls into one of four kinds:
//!
//! - **Argument**: malformed or missing input to a setup call. Caller bug, never retried.
//! - **Transport**: broker unreachable, queue creation or deletion failed.
//!   The caller may retry at the session-setup level. A full queue is a
//!   transport failure of its own variant so publishers can back off.
//! - **Security**: decryption, authentication or control validation failed.
//!   Never retried; the affected session is terminated.
//! - **Protocol**: a well-formed but unexpected message for the current
//!   queue or state. Terminates the affected session.

use relaygate_crypto::CryptoError;
use std::borrow::Cow;
use thiserror::Error;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input
    Argument,
    /// Broker or socket failure
    Transport,
    /// Authentication or validation failure
    Security,
    /// Unexpected message for the queue or state
    Protocol,
}

/// Relay errors
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// Invalid argument to a relay operation
    #[error("Invalid argument: {0}")]
    Argument(Cow<'static, str>),

    /// Broker transport failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Broker refused a message because the queue backlog is full
    #[error("Queue full: {0}")]
    QueueFull(Cow<'static, str>),

    /// Message failed authentication or validation
    #[error("Security error: {0}")]
    Security(Cow<'static, str>),

    /// Unexpected message
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create an argument error
    #[must_use]
    pub fn argument(msg: impl Into<Cow<'static, str>>) -> Self {
        RelayError::Argument(msg.into())
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(msg: impl Into<Cow<'static, str>>) -> Self {
        RelayError::Transport(msg.into())
    }

    /// Create a security error
    #[must_use]
    pub fn security(msg: impl Into<Cow<'static, str>>) -> Self {
        RelayError::Security(msg.into())
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Error category
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Argument(_) => ErrorKind::Argument,
            RelayError::Transport(_) | RelayError::QueueFull(_) => ErrorKind::Transport,
            RelayError::Security(_) => ErrorKind::Security,
            RelayError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Returns true if the broker refused a publish for lack of room
    #[must_use]
    pub fn is_queue_full(&self) -> bool {
        matches!(self, RelayError::QueueFull(_))
    }

    /// Returns true if retrying session setup may succeed.
    ///
    /// Only transport failures qualify. Nothing inside the relay layer
    /// retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        RelayError::Security(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::Protocol(Cow::Owned(format!("undecodable frame: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(RelayError::argument("x").kind(), ErrorKind::Argument);
        assert_eq!(RelayError::transport("x").kind(), ErrorKind::Transport);
        assert_eq!(RelayError::security("x").kind(), ErrorKind::Security);
        assert_eq!(RelayError::protocol("x").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(RelayError::transport("broker down").is_retryable());
        assert!(!RelayError::security("forged").is_retryable());
        assert!(!RelayError::argument("empty").is_retryable());
        assert!(!RelayError::protocol("data on control queue").is_retryable());
    }

    #[test]
    fn test_queue_full_is_transport() {
        let err = RelayError::QueueFull("q".into());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_queue_full());
        assert!(!RelayError::transport("q").is_queue_full());
    }

    #[test]
    fn test_crypto_errors_are_security() {
        let err: RelayError = CryptoError::InvalidSignature.into();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn test_io_errors_are_transport() {
        let err: RelayError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "Transport error: refused");
    }
}
