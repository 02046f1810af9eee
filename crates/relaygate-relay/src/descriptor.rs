//! Relay descriptors.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a relay broker lives.
///
/// Supplied by orchestration, and carried inside SWITCH requests to name
/// the relay a session migrates to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Whether the broker connection is expected to run under mutual TLS
    #[serde(default)]
    pub secure: bool,
}

impl RelayDescriptor {
    /// Create a descriptor for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// Check the descriptor names a reachable endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Argument`] on an empty host or a zero port.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RelayError::argument("relay host is empty"));
        }
        if self.port == 0 {
            return Err(RelayError::argument("relay port is zero"));
        }
        Ok(())
    }

    /// `host:port`, suitable for address resolution
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RelayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RelayDescriptor {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::argument(format!("expected <host>:<port>, got {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RelayError::argument(format!("invalid relay port {port:?}")))?;
        let descriptor = Self::new(host, port);
        descriptor.validate()?;
        Ok(descriptor)
    }
}
