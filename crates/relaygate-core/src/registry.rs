//! Process-wide table of local sessions and relay bindings.

use crate::error::{GatewayError, Result};
use crate::handle::WorkerHandle;
use crate::model::{ActiveSessionRecord, SessionSide};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaygate_relay::{RelayBinding, RelayDescriptor, SessionId};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway counters
#[derive(Debug, Default)]
pub struct GatewayStats {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    bytes_to_relay: AtomicU64,
    bytes_from_relay: AtomicU64,
    security_failures: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Sessions registered since start
    pub sessions_opened: u64,
    /// Sessions torn down since start
    pub sessions_closed: u64,
    /// Sessions currently registered
    pub active_sessions: u64,
    /// Plaintext bytes read from local sockets and sent to relays
    pub bytes_to_relay: u64,
    /// Plaintext bytes received from relays and written to local sockets
    pub bytes_from_relay: u64,
    /// Messages rejected by authentication
    pub security_failures: u64,
    /// Open relay bindings
    pub relay_bindings: u64,
}

impl GatewayStats {
    pub(crate) fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_to_relay(&self, bytes: usize) {
        self.bytes_to_relay
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_from_relay(&self, bytes: usize) {
        self.bytes_from_relay
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn security_failure(&self) {
        self.security_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Concurrent registry of session workers and relay bindings.
///
/// Consumer-side and provider-side sessions live in separate maps so one
/// gateway can serve both ends of the same session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    consumers: DashMap<SessionId, Arc<WorkerHandle>>,
    providers: DashMap<SessionId, Arc<WorkerHandle>>,
    bindings: DashMap<RelayDescriptor, Arc<RelayBinding>>,
    stats: GatewayStats,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn side_map(&self, side: SessionSide) -> &DashMap<SessionId, Arc<WorkerHandle>> {
        match side {
            SessionSide::Consumer => &self.consumers,
            SessionSide::Provider => &self.providers,
        }
    }

    /// Add a worker handle.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidState`] if the same side of the session
    /// is already registered.
    pub fn register(&self, handle: Arc<WorkerHandle>) -> Result<()> {
        match self.side_map(handle.side()).entry(handle.session().clone()) {
            Entry::Occupied(_) => Err(GatewayError::InvalidState(Cow::Owned(format!(
                "{} side of session {} already registered",
                handle.side(),
                handle.session()
            )))),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Remove a worker handle
    pub fn deregister(&self, side: SessionSide, session: &SessionId) -> Option<Arc<WorkerHandle>> {
        self.side_map(side).remove(session).map(|(_, handle)| handle)
    }

    /// Handle of one side of a session
    #[must_use]
    pub fn get(&self, side: SessionSide, session: &SessionId) -> Option<Arc<WorkerHandle>> {
        self.side_map(side).get(session).map(|e| e.value().clone())
    }

    /// Handles of every local side of `session`
    #[must_use]
    pub fn find(&self, session: &SessionId) -> Vec<Arc<WorkerHandle>> {
        [SessionSide::Consumer, SessionSide::Provider]
            .into_iter()
            .filter_map(|side| self.get(side, session))
            .collect()
    }

    /// Snapshot of the handles of one side
    #[must_use]
    pub fn handles(&self, side: SessionSide) -> Vec<Arc<WorkerHandle>> {
        self.side_map(side)
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Snapshot of the records of every registered session, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<ActiveSessionRecord> {
        let mut records: Vec<ActiveSessionRecord> = self
            .consumers
            .iter()
            .chain(self.providers.iter())
            .map(|e| e.value().record().clone())
            .collect();
        records.sort_by_key(|r| r.started_at_ms);
        records
    }

    /// Sessions whose queues are still owned by a local worker
    #[must_use]
    pub fn live_sessions(&self) -> HashSet<SessionId> {
        self.consumers
            .iter()
            .chain(self.providers.iter())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of registered session sides
    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.len() + self.providers.len()
    }

    /// Returns true if no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open binding to `relay`, if any
    #[must_use]
    pub fn binding(&self, relay: &RelayDescriptor) -> Option<Arc<RelayBinding>> {
        self.bindings
            .get(relay)
            .map(|e| e.value().clone())
            .filter(|b| b.is_open())
    }

    /// Store `binding` unless an open binding to the same relay already
    /// exists. Returns the binding to use.
    pub fn insert_binding(&self, binding: Arc<RelayBinding>) -> Arc<RelayBinding> {
        match self.bindings.entry(binding.relay().clone()) {
            Entry::Occupied(mut slot) if !slot.get().is_open() => {
                slot.insert(binding.clone());
                binding
            }
            Entry::Occupied(slot) => slot.get().clone(),
            Entry::Vacant(slot) => {
                slot.insert(binding.clone());
                binding
            }
        }
    }

    /// Remove `binding` if it is still the one stored for its relay
    pub fn remove_binding(&self, binding: &Arc<RelayBinding>) -> bool {
        self.bindings
            .remove_if(binding.relay(), |_, stored| Arc::ptr_eq(stored, binding))
            .is_some()
    }

    /// Snapshot of all bindings
    #[must_use]
    pub fn bindings(&self) -> Vec<Arc<RelayBinding>> {
        self.bindings.iter().map(|e| e.value().clone()).collect()
    }

    /// Gateway counters
    #[must_use]
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Copy of the counters
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_opened: self.stats.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.stats.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.len() as u64,
            bytes_to_relay: self.stats.bytes_to_relay.load(Ordering::Relaxed),
            bytes_from_relay: self.stats.bytes_from_relay.load(Ordering::Relaxed),
            security_failures: self.stats.security_failures.load(Ordering::Relaxed),
            relay_bindings: self.bindings.iter().filter(|e| e.value().is_open()).count() as u64,
        }
    }
}
