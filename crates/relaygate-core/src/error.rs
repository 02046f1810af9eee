//! Error types for the gateway
//!
//! [`GatewayError`] wraps the relay layer's [`RelayError`] and adds the
//! failures that only exist once sessions are registered and sockets are in
//! play. Every variant maps onto one of the four [`ErrorKind`]s so callers
//! can treat both layers uniformly.
//!
//! # Example
//!
//! ```no_run
//! use relaygate_core::GatewayError;
//!
//! fn report(err: &GatewayError) {
//!     if err.is_retryable() {
//!         println!("relay unavailable, try again: {err}");
//!     } else {
//!         println!("session refused: {err}");
//!     }
//! }
//! ```

use relaygate_relay::{ErrorKind, RelayError, SessionId};
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by gateway operations
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Relay, broker or crypto failure
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// No local session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid session state or transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(Cow<'static, str>),
}

impl GatewayError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Relay(e) => e.kind(),
            GatewayError::SessionNotFound(_)
            | GatewayError::InvalidConfig(_)
            | GatewayError::InvalidState(_) => ErrorKind::Argument,
            GatewayError::Io(_) => ErrorKind::Transport,
        }
    }

    /// Returns true if the same call may succeed later.
    ///
    /// Only relay transport failures qualify. A broken local socket is
    /// never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Relay(e) if e.is_retryable())
    }

    /// Returns true for authentication and integrity failures
    #[must_use]
    pub fn is_security(&self) -> bool {
        self.kind() == ErrorKind::Security
    }

    /// Create an invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        GatewayError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        GatewayError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an I/O error with static context
    #[must_use]
    pub const fn io(context: &'static str) -> Self {
        GatewayError::Io(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(Cow::Owned(err.to_string()))
    }
}

impl From<relaygate_crypto::CryptoError> for GatewayError {
    fn from(err: relaygate_crypto::CryptoError) -> Self {
        GatewayError::Relay(err.into())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
