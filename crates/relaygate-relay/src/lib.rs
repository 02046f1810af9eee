//! # RelayGate Relay
//!
//! Relay transport layer for RelayGate tunnels.
//!
//! This crate provides:
//! - A queue broker wire protocol and the [`RelayServer`] that speaks it
//! - The [`Broker`] capability trait with a TCP client ([`RemoteBroker`])
//!   and an in-process implementation ([`MemoryBroker`])
//! - Session queue naming (the queue quadruple)
//! - The Relay Transport Binding ([`RelayBinding`]) and the
//!   [`GatewayRelayClient`] that sets up, feeds and tears down session queues
//! - CLOSE / SWITCH control messages
//!
//! ## Architecture
//!
//! ```text
//!   consumer gateway                                   provider gateway
//!  ┌──────────────────┐                               ┌──────────────────┐
//!  │ GatewayRelayClient│    RESP-<peer>-<id>  ───►    │ GatewayRelayClient│
//!  │   RelayBinding    │    REQ-<peer>-<id>   ◄───    │   RelayBinding    │
//!  └────────┬─────────┘     (+ -CONTROL pairs)        └────────┬─────────┘
//!           │                ┌─────────────┐                   │
//!           └──────────────► │ RelayServer │ ◄─────────────────┘
//!                            │ (untrusted) │
//!                            └─────────────┘
//! ```
//!
//! Every payload crossing the relay is a sealed envelope; the relay only
//! ever sees queue names and ciphertext.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod broker;
pub mod client;
pub mod control;
pub mod descriptor;
pub mod error;
pub mod gateway_client;
pub mod memory;
pub mod message;
pub mod naming;
pub mod protocol;
pub mod queues;
pub mod server;

pub use binding::{BindingLease, RelayBinding, StaleSweep};
pub use broker::{Broker, BrokerConnector, Consumer, Producer};
pub use client::{RemoteBroker, RemoteBrokerConfig, TcpConnector};
pub use control::{ControlMessage, SwitchRequest};
pub use descriptor::RelayDescriptor;
pub use error::{ErrorKind, RelayError, Result};
pub use gateway_client::{
    ConsumerSideRelayInfo, ControlRelayInfo, GatewayRelayClient, ProviderSideRelayInfo,
};
pub use memory::{MemoryBroker, MemoryConnector};
pub use message::BrokerMessage;
pub use naming::{QueueQuadruple, SessionId};
pub use server::{RelayServer, RelayServerConfig};

/// Default relay broker port
pub const DEFAULT_RELAY_PORT: u16 = 61617;

/// Maximum broker frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Broker keepalive interval (30 seconds)
pub const RELAY_KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Broker connection timeout (10 seconds)
pub const RELAY_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
