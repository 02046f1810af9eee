//! CLOSE / SWITCH control messages.
//!
//! Control bodies are sealed like data and only ever travel on the control
//! queues. A body starts with a 4-byte tag so that a data payload pushed onto
//! a control queue is recognized as such instead of being misparsed.

use crate::descriptor::RelayDescriptor;
use crate::error::{RelayError, Result};
use crate::naming::SessionId;
use serde::{Deserialize, Serialize};

const CONTROL_TAG: &[u8; 4] = b"RGC1";

/// Control-plane message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Tear the session down
    Close {
        /// Session queue id
        queue_id: String,
    },
    /// Move the session to another relay
    Switch {
        /// Session queue id
        queue_id: String,
        /// Relay to move to
        relay: RelayDescriptor,
        /// Sender clock at issue time, milliseconds since the Unix epoch
        issued_at_ms: u64,
    },
}

/// A validated SWITCH request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchRequest {
    /// Session being migrated
    pub session: SessionId,
    /// Relay to migrate to
    pub relay: RelayDescriptor,
    /// Sender clock at issue time
    pub issued_at_ms: u64,
}

impl ControlMessage {
    /// CLOSE for `session`
    #[must_use]
    pub fn close(session: &SessionId) -> Self {
        ControlMessage::Close {
            queue_id: session.queue_id().to_string(),
        }
    }

    /// SWITCH for `session` to `relay`, stamped with the current time
    #[must_use]
    pub fn switch(session: &SessionId, relay: RelayDescriptor) -> Self {
        let issued_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        ControlMessage::Switch {
            queue_id: session.queue_id().to_string(),
            relay,
            issued_at_ms,
        }
    }

    /// Message name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Close { .. } => "CLOSE",
            ControlMessage::Switch { .. } => "SWITCH",
        }
    }

    /// Queue id the message refers to
    #[must_use]
    pub fn queue_id(&self) -> &str {
        match self {
            ControlMessage::Close { queue_id } | ControlMessage::Switch { queue_id, .. } => queue_id,
        }
    }

    /// Encode as a tagged body.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = CONTROL_TAG.to_vec();
        body.extend_from_slice(&bincode::serialize(self)?);
        Ok(body)
    }

    /// Decode a tagged body.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if the body is not a control message.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let rest = body
            .strip_prefix(CONTROL_TAG)
            .ok_or_else(|| RelayError::protocol("data payload on control queue"))?;
        Ok(bincode::deserialize(rest)?)
    }

    /// Check this is a CLOSE for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] for a SWITCH and
    /// [`RelayError::Security`] for a CLOSE naming another queue id.
    pub fn expect_close(&self, session: &SessionId) -> Result<()> {
        match self {
            ControlMessage::Close { queue_id } if queue_id == session.queue_id() => Ok(()),
            ControlMessage::Close { queue_id } => Err(RelayError::security(format!(
                "CLOSE for queue {queue_id} received on session {session}"
            ))),
            ControlMessage::Switch { .. } => {
                Err(RelayError::protocol("SWITCH received where CLOSE was expected"))
            }
        }
    }

    /// Check this is a well-formed SWITCH for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Security`] if it is not a SWITCH, names another
    /// queue id, or carries an unusable relay descriptor.
    pub fn expect_switch(self, session: &SessionId) -> Result<SwitchRequest> {
        match self {
            ControlMessage::Switch {
                queue_id,
                relay,
                issued_at_ms,
            } => {
                if queue_id != session.queue_id() {
                    return Err(RelayError::security(format!(
                        "SWITCH for queue {queue_id} received on session {session}"
                    )));
                }
                relay
                    .validate()
                    .map_err(|e| RelayError::security(format!("SWITCH relay rejected: {e}")))?;
                Ok(SwitchRequest {
                    session: session.clone(),
                    relay,
                    issued_at_ms,
                })
            }
            ControlMessage::Close { .. } => {
                Err(RelayError::security("CLOSE received where SWITCH was expected"))
            }
        }
    }
}
