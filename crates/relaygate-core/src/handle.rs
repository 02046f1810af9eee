//! Non-owning view of a running session worker.
//!
//! The registry and supervision only ever see a [`WorkerHandle`]. Sockets
//! and relay handles stay inside the worker; the handle carries the
//! signals, the last-interaction clock and what observers may read.

use crate::error::{GatewayError, Result};
use crate::model::{ActiveSessionRecord, SessionSide, now_ms};
use crate::session::{SessionState, StateCell};
use relaygate_relay::{RelayDescriptor, SessionId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Requests a worker acts on from inside its relay loop
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Move the session to `relay` as the initiator
    Switch {
        relay: RelayDescriptor,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Shared handle on one session worker
#[derive(Debug)]
pub struct WorkerHandle {
    record: ActiveSessionRecord,
    state: StateCell,
    last_interaction_ms: AtomicU64,
    /// Drain queued relay data, then stop
    interrupt: CancellationToken,
    /// Stop now
    close: CancellationToken,
    finished: CancellationToken,
    teardown_started: AtomicBool,
    relay: RwLock<RelayDescriptor>,
    last_error: Mutex<Option<GatewayError>>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub(crate) fn new(
        record: ActiveSessionRecord,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            relay: RwLock::new(record.relay.clone()),
            last_interaction_ms: AtomicU64::new(record.started_at_ms),
            record,
            state: StateCell::new(),
            interrupt: CancellationToken::new(),
            close: CancellationToken::new(),
            finished: CancellationToken::new(),
            teardown_started: AtomicBool::new(false),
            last_error: Mutex::new(None),
            commands,
        };
        (handle, rx)
    }

    /// Session identity
    #[must_use]
    pub fn session(&self) -> &SessionId {
        &self.record.session
    }

    /// Local side of the session
    #[must_use]
    pub fn side(&self) -> SessionSide {
        self.record.side
    }

    /// Record fixed at establishment
    #[must_use]
    pub fn record(&self) -> &ActiveSessionRecord {
        &self.record
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub(crate) fn transition_to(&self, to: SessionState) -> Result<SessionState> {
        self.state.transition_to(to)
    }

    /// Relay currently carrying the session
    #[must_use]
    pub fn relay(&self) -> RelayDescriptor {
        self.relay
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_relay(&self, relay: RelayDescriptor) {
        *self.relay.write().unwrap_or_else(PoisonError::into_inner) = relay;
    }

    /// Last byte transfer in either direction, milliseconds since the Unix epoch
    #[must_use]
    pub fn last_interaction_ms(&self) -> u64 {
        self.last_interaction_ms.load(Ordering::Relaxed)
    }

    /// Time since the last transfer as seen at `now_ms`
    #[must_use]
    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_interaction_ms()))
    }

    /// Record a transfer now
    pub fn touch(&self) {
        self.touch_at(now_ms());
    }

    /// Record a transfer at `ms`. The clock never moves backwards.
    pub fn touch_at(&self, ms: u64) {
        self.last_interaction_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Ask the worker to drain queued relay data and stop. Never blocks.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Ask the worker to stop immediately. Never blocks.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Returns true once an interrupt was requested
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Returns true once an immediate close was requested
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    pub(crate) fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    /// Wait until the worker has torn the session down
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Returns true once the session reached [`SessionState::Closed`]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Claim the teardown. Only the first caller gets `true`.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.teardown_started.swap(true, Ordering::AcqRel)
    }

    /// Error that ended the session or was tolerated by policy
    #[must_use]
    pub fn last_error(&self) -> Option<GatewayError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_error(&self, err: GatewayError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    pub(crate) fn send_command(&self, command: WorkerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::invalid_state("session worker is gone"))
    }
}
