//! Descriptors supplied by orchestration and the per-session record.

use relaygate_relay::{QueueQuadruple, RelayDescriptor, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A system taking part in a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemDescriptor {
    /// System name
    pub name: String,
    /// Host name or address the system is reachable at
    pub address: String,
    /// Service port
    pub port: u16,
}

impl SystemDescriptor {
    /// Create a descriptor
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port`, as accepted by `TcpStream::connect`
    #[must_use]
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for SystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.socket_addr())
    }
}

/// An administrative cloud
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudDescriptor {
    /// Operator owning the cloud
    pub operator: String,
    /// Cloud name
    pub name: String,
}

impl CloudDescriptor {
    /// Create a descriptor
    #[must_use]
    pub fn new(operator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CloudDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.operator)
    }
}

/// The service consumed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name
    pub name: String,
    /// Interface the service speaks, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl ServiceDefinition {
    /// Service without an interface annotation
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: None,
        }
    }
}

/// Which end of the tunnel a local session serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSide {
    /// Accepts a local client and forwards to the relay
    Consumer,
    /// Connects to the real provider and forwards to the relay
    Provider,
}

impl fmt::Display for SessionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionSide::Consumer => "consumer",
            SessionSide::Provider => "provider",
        })
    }
}

/// Everything known about one local session, fixed at establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSessionRecord {
    /// Session identity
    pub session: SessionId,
    /// Local side
    pub side: SessionSide,
    /// Consuming system
    pub consumer: SystemDescriptor,
    /// Providing system
    pub provider: SystemDescriptor,
    /// Cloud of the consumer
    pub consumer_cloud: CloudDescriptor,
    /// Cloud of the provider
    pub provider_cloud: CloudDescriptor,
    /// Service carried
    pub service: ServiceDefinition,
    /// Relay the session was established on
    pub relay: RelayDescriptor,
    /// The four queue names
    pub queues: QueueQuadruple,
    /// Establishment time, milliseconds since the Unix epoch
    pub started_at_ms: u64,
    /// Local listening port, consumer side only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
