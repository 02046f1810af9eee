//! Session lifecycle state machine.
//!
//! ```text
//! Establishing ──► Open ──► Closing ──► Closed
//!      │                       ▲
//!      └───────────────────────┘
//! ```
//!
//! `Open` is the only state in which socket bytes are forwarded. `Closing`
//! accepts no new socket bytes but still delivers relay messages that were
//! already read. `Closed` is terminal.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one local session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Queues open, local socket not yet connected
    Establishing,
    /// Forwarding bytes
    Open,
    /// Tearing down
    Closing,
    /// Queues destroyed and deregistered
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub fn can_transition(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (
                SessionState::Establishing,
                SessionState::Open | SessionState::Closing
            ) | (SessionState::Open, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }

    /// Returns true while bytes may flow
    #[must_use]
    pub fn is_open(self) -> bool {
        self == SessionState::Open
    }

    /// Returns true once teardown started
    #[must_use]
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    const fn to_u8(self) -> u8 {
        match self {
            SessionState::Establishing => 0,
            SessionState::Open => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Establishing,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// State shared between a worker and the observers holding its handle.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// New cell in [`SessionState::Establishing`]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Establishing.to_u8()))
    }

    /// Current state
    #[must_use]
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the transition is legal.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidState`] for an illegal transition,
    /// leaving the state unchanged.
    pub fn transition_to(&self, to: SessionState) -> Result<SessionState> {
        let mut current = self.get();
        loop {
            if !current.can_transition(to) {
                return Err(GatewayError::InvalidState(Cow::Owned(format!(
                    "cannot move session from {current:?} to {to:?}"
                ))));
            }
            match self.0.compare_exchange(
                current.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!("Session state transition: {:?} -> {:?}", current, to);
                    return Ok(current);
                }
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Establishing);
        cell.transition_to(SessionState::Open).unwrap();
        assert!(cell.get().is_open());
        cell.transition_to(SessionState::Closing).unwrap();
        assert!(cell.get().is_terminating());
        cell.transition_to(SessionState::Closed).unwrap();
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_establishing_can_abort() {
        let cell = StateCell::new();
        assert_eq!(
            cell.transition_to(SessionState::Closing).unwrap(),
            SessionState::Establishing
        );
    }

    #[test]
    fn test_no_way_back_from_closed() {
        let cell = StateCell::new();
        cell.transition_to(SessionState::Closing).unwrap();
        cell.transition_to(SessionState::Closed).unwrap();
        for to in [
            SessionState::Establishing,
            SessionState::Open,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert!(matches!(
                cell.transition_to(to),
                Err(GatewayError::InvalidState(_))
            ));
        }
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_skipping_closing_rejected() {
        let cell = StateCell::new();
        cell.transition_to(SessionState::Open).unwrap();
        assert!(cell.transition_to(SessionState::Closed).is_err());
        assert!(cell.transition_to(SessionState::Establishing).is_err());
        assert_eq!(cell.get(), SessionState::Open);
    }
}
