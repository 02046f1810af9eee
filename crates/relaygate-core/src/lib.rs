//! # RelayGate Core
//!
//! Gateway side of RelayGate tunnels.
//!
//! This crate provides:
//! - The [`Gateway`] composition root: session setup, listing, closing and
//!   relay failover
//! - Socket bridge workers forwarding between a local TCP socket and the
//!   session's relay queues
//! - The [`SessionRegistry`] shared with supervision
//! - Idle-session and stale-queue supervision
//!
//! ## Architecture
//!
//! ```text
//!  local client ──► consumer worker ──► RESP-… ──► provider worker ──► provider
//!  local client ◄── consumer worker ◄── REQ-…  ◄── provider worker ◄── provider
//!                          ▲                               ▲
//!                          └──── CLOSE / SWITCH on -CONTROL ┘
//! ```
//!
//! Each side runs one worker per session; supervision only signals workers
//! through their [`WorkerHandle`] and never touches their sockets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod handle;
pub mod listener;
pub mod model;
pub mod registry;
pub mod session;
pub mod supervision;
mod worker;

pub use config::{
    GatewayConfig, MAX_BUFFER_SIZE, RelayClientConfig, SupervisionConfig, SwitchFailurePolicy,
    TunnelConfig,
};
pub use error::{GatewayError, Result};
pub use gateway::{ConnectRequest, ConnectSide, Gateway, SessionEndpoints, SessionHandle};
pub use handle::WorkerHandle;
pub use listener::PortAllocator;
pub use model::{
    ActiveSessionRecord, CloudDescriptor, ServiceDefinition, SessionSide, SystemDescriptor,
};
pub use registry::{GatewayStats, SessionRegistry, StatsSnapshot};
pub use session::{SessionState, StateCell};
pub use supervision::{SweepReport, Supervisor, sweep_idle_sessions, sweep_relays};

pub use relaygate_crypto::{Identity, PeerPublicKey};
pub use relaygate_relay::{RelayDescriptor, SessionId};
