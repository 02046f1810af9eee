//! Relay Transport Binding.
//!
//! One binding per physical broker connection. It is the only component
//! that creates and destroys queues, and it remembers every session
//! quadruple opened through it so that supervision can reclaim the ones no
//! worker owns any more.
//!
//! Session setup holds a [`BindingLease`] from the moment it picks a binding
//! until its quadruple is tracked. The stale sweep never closes a leased
//! binding, and a binding the sweep has started closing hands out no leases.

use crate::broker::{Broker, BrokerConnector};
use crate::descriptor::RelayDescriptor;
use crate::error::{RelayError, Result};
use crate::naming::SessionId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one stale sweep over a binding.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleSweep {
    /// Sessions whose quadruple was destroyed
    pub destroyed: Vec<SessionId>,
    /// Sessions where at least one queue could not be removed
    pub failed: Vec<SessionId>,
    /// Whether the binding closed its connection
    pub binding_closed: bool,
}

/// Set in `leases` once the sweep has claimed the binding for closing
const CLOSING: usize = 1 << (usize::BITS - 1);

/// Broker connection plus the quadruples opened through it.
pub struct RelayBinding {
    relay: RelayDescriptor,
    broker: Arc<dyn Broker>,
    opened: DashMap<SessionId, Instant>,
    created: Instant,
    /// Milliseconds after `created` at which a quadruple was last tracked
    last_tracked_ms: AtomicU64,
    /// Outstanding leases, plus the [`CLOSING`] bit
    leases: AtomicUsize,
    closed: AtomicBool,
}

impl RelayBinding {
    /// Wrap an existing broker connection.
    #[must_use]
    pub fn new(relay: RelayDescriptor, broker: Arc<dyn Broker>) -> Self {
        Self {
            relay,
            broker,
            opened: DashMap::new(),
            created: Instant::now(),
            last_tracked_ms: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a broker connection to `relay` presenting `local_name`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the relay cannot be reached.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        relay: &RelayDescriptor,
        local_name: &str,
    ) -> Result<Arc<Self>> {
        let broker = connector.connect(relay, local_name).await?;
        info!(relay = %relay, name = %local_name, "Relay binding opened");
        Ok(Arc::new(Self::new(relay.clone(), broker)))
    }

    /// Relay this binding is connected to
    #[must_use]
    pub fn relay(&self) -> &RelayDescriptor {
        &self.relay
    }

    /// Name presented to the relay
    #[must_use]
    pub fn local_name(&self) -> &str {
        self.broker.client_name()
    }

    /// Returns true while the binding can create queues and carry traffic
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.leases.load(Ordering::Acquire) & CLOSING == 0
            && self.broker.is_open()
    }

    /// Broker session, if the binding is still usable.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when the broker session is closed.
    /// Setup may retry on a fresh binding.
    pub fn broker(&self) -> Result<Arc<dyn Broker>> {
        if self.is_open() {
            Ok(self.broker.clone())
        } else {
            Err(RelayError::transport(format!(
                "broker session for relay {} is closed",
                self.relay
            )))
        }
    }

    /// Pin the binding open for a session being set up on it. `None` if the
    /// binding is closed or being closed.
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> Option<BindingLease> {
        let mut current = self.leases.load(Ordering::Acquire);
        loop {
            if current & CLOSING != 0 || !self.is_open() {
                return None;
            }
            match self.leases.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BindingLease {
                        binding: self.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of outstanding leases
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire) & !CLOSING
    }

    /// Claim an unleased binding for closing.
    fn claim_for_close(&self) -> bool {
        self.leases
            .compare_exchange(0, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record that the quadruple of `session` was opened through this binding
    pub fn track(&self, session: &SessionId) {
        self.opened
            .entry(session.clone())
            .or_insert_with(Instant::now);
        let elapsed = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_tracked_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Forget `session`, after its queues were destroyed
    pub fn untrack(&self, session: &SessionId) {
        self.opened.remove(session);
    }

    /// Returns true if the quadruple of `session` is tracked here
    #[must_use]
    pub fn is_tracking(&self, session: &SessionId) -> bool {
        self.opened.contains_key(session)
    }

    /// Snapshot of tracked sessions
    #[must_use]
    pub fn tracked(&self) -> Vec<SessionId> {
        self.opened.iter().map(|e| e.key().clone()).collect()
    }

    /// Delete all four queues of `session` and stop tracking it when they
    /// are gone. Returns true only if every queue was removed.
    pub async fn destroy_quadruple(&self, session: &SessionId) -> bool {
        let mut clean = true;
        for queue in session.queues().names() {
            if let Err(e) = self.broker.delete_queue(queue).await {
                debug!(relay = %self.relay, queue, error = %e, "Queue not removed");
                clean = false;
            }
        }
        if clean {
            self.untrack(session);
        }
        clean
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_tracked_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Destroy quadruples no live worker owns and close the binding when
    /// nothing is left on it.
    ///
    /// `live` holds the sessions whose workers currently use this relay.
    /// A quadruple younger than `grace` is left alone, as is a binding that
    /// tracked something within `grace`.
    pub async fn destroy_stale_queues_and_connections(
        &self,
        live: &HashSet<SessionId>,
        grace: Duration,
    ) -> StaleSweep {
        let mut sweep = StaleSweep::default();

        let stale: Vec<SessionId> = self
            .opened
            .iter()
            .filter(|e| !live.contains(e.key()) && e.value().elapsed() >= grace)
            .map(|e| e.key().clone())
            .collect();

        if self.broker.is_open() {
            for session in stale {
                let clean = self.destroy_quadruple(&session).await;
                self.opened.remove(&session);
                if clean {
                    sweep.destroyed.push(session);
                } else {
                    sweep.failed.push(session);
                }
            }
        } else {
            for session in stale {
                self.opened.remove(&session);
                sweep.failed.push(session);
            }
        }

        if self.opened.is_empty() && self.idle_for() >= grace {
            if self.claim_for_close() {
                self.close().await;
                sweep.binding_closed = true;
            } else {
                debug!(relay = %self.relay, leases = self.lease_count(), "Idle binding in use by session setup");
            }
        }

        if !sweep.destroyed.is_empty() || !sweep.failed.is_empty() {
            info!(
                relay = %self.relay,
                destroyed = sweep.destroyed.len(),
                failed = sweep.failed.len(),
                "Reclaimed stale relay queues"
            );
        }
        sweep
    }

    /// Close the broker connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.opened.is_empty() {
            warn!(
                relay = %self.relay,
                sessions = self.opened.len(),
                "Closing relay binding with open quadruples"
            );
        }
        self.broker.close().await;
        info!(relay = %self.relay, "Relay binding closed");
    }
}

/// A binding pinned open while a session is set up on it. Dereferences to
/// the binding; dropping it releases the pin.
pub struct BindingLease {
    binding: Arc<RelayBinding>,
}

impl BindingLease {
    /// The leased binding
    #[must_use]
    pub fn binding(&self) -> &Arc<RelayBinding> {
        &self.binding
    }
}

impl std::ops::Deref for BindingLease {
    type Target = RelayBinding;

    fn deref(&self) -> &RelayBinding {
        &self.binding
    }
}

impl Drop for BindingLease {
    fn drop(&mut self) {
        self.binding.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for BindingLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BindingLease").field(&self.binding.relay).finish()
    }
}

impl std::fmt::Debug for RelayBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBinding")
            .field("relay", &self.relay)
            .field("sessions", &self.opened.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Producer;
    use crate::memory::MemoryConnector;

    async fn binding(connector: &MemoryConnector) -> Arc<RelayBinding> {
        RelayBinding::connect(connector, &RelayDescriptor::new("relay", 61617), "gw")
            .await
            .unwrap()
    }

    async fn open_quadruple(binding: &RelayBinding, session: &SessionId) {
        let broker = binding.broker().unwrap();
        for queue in session.queues().names() {
            Producer::open(broker.clone(), queue).await.unwrap();
        }
        binding.track(session);
    }

    #[tokio::test]
    async fn test_closed_binding_is_transport_error() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        binding.close().await;
        binding.close().await;

        let err = binding.broker().err().unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(err.is_retryable());
        assert!(binding.lease().is_none());
    }

    #[tokio::test]
    async fn test_sweep_spares_leased_binding() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        let lease = binding.lease().unwrap();

        let sweep = binding
            .destroy_stale_queues_and_connections(&HashSet::new(), Duration::ZERO)
            .await;
        assert!(!sweep.binding_closed);
        assert!(lease.broker().is_ok());

        let session = SessionId::new("gw", "late").unwrap();
        open_quadruple(&lease, &session).await;
        drop(lease);
        assert_eq!(binding.lease_count(), 0);

        binding.untrack(&session);
        let sweep = binding
            .destroy_stale_queues_and_connections(&HashSet::new(), Duration::ZERO)
            .await;
        assert!(sweep.binding_closed);
        assert!(!binding.is_open());
        assert!(binding.lease().is_none());
    }

    #[tokio::test]
    async fn test_stale_quadruple_destroyed_live_kept() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        let table = connector.table(binding.relay());

        let live = SessionId::new("gw", "live").unwrap();
        let dead = SessionId::new("gw", "dead").unwrap();
        open_quadruple(&binding, &live).await;
        open_quadruple(&binding, &dead).await;

        let live_set: HashSet<SessionId> = [live.clone()].into_iter().collect();
        let sweep = binding
            .destroy_stale_queues_and_connections(&live_set, Duration::ZERO)
            .await;

        assert_eq!(sweep.destroyed, vec![dead.clone()]);
        assert!(!sweep.binding_closed);
        assert!(table.contains(&live.queues().request));
        assert!(!table.contains(&dead.queues().request_control));
        assert!(binding.is_tracking(&live));
    }

    #[tokio::test]
    async fn test_young_quadruple_survives_grace() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        let session = SessionId::new("gw", "young").unwrap();
        open_quadruple(&binding, &session).await;

        let sweep = binding
            .destroy_stale_queues_and_connections(&HashSet::new(), Duration::from_secs(3600))
            .await;

        assert!(sweep.destroyed.is_empty());
        assert!(binding.is_tracking(&session));
        assert!(binding.is_open());
    }

    #[tokio::test]
    async fn test_destroy_quadruple() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        let table = connector.table(binding.relay());
        let session = SessionId::new("gw", "moved").unwrap();
        open_quadruple(&binding, &session).await;

        assert!(binding.destroy_quadruple(&session).await);
        assert!(table.is_empty());
        assert!(!binding.is_tracking(&session));
        assert!(!binding.destroy_quadruple(&session).await);
    }

    #[tokio::test]
    async fn test_empty_binding_closed() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector).await;
        let session = SessionId::new("gw", "gone").unwrap();
        open_quadruple(&binding, &session).await;

        let sweep = binding
            .destroy_stale_queues_and_connections(&HashSet::new(), Duration::ZERO)
            .await;

        assert_eq!(sweep.destroyed, vec![session]);
        assert!(sweep.binding_closed);
        assert!(!binding.is_open());
    }
}
