//! Session identities and queue names.
//!
//! Queue names are a wire contract shared with every gateway using the
//! relay and must stay bit-exact:
//!
//! ```text
//! REQ-<peer>-<queueId>            REQ-<peer>-<queueId>-CONTROL
//! RESP-<peer>-<queueId>           RESP-<peer>-<queueId>-CONTROL
//! ```

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const REQUEST_PREFIX: &str = "REQ-";
const RESPONSE_PREFIX: &str = "RESP-";
const CONTROL_SUFFIX: &str = "-CONTROL";

/// Identity of one tunnel session: `(peer_name, queue_id)`.
///
/// `peer_name` is the name the provider-side gateway presents to the relay,
/// `queue_id` is minted once per session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    peer_name: String,
    queue_id: String,
}

impl SessionId {
    /// Build a session id from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Argument`] if either part is empty.
    pub fn new(peer_name: impl Into<String>, queue_id: impl Into<String>) -> Result<Self> {
        let peer_name = peer_name.into();
        let queue_id = queue_id.into();
        if peer_name.is_empty() {
            return Err(RelayError::argument("peer name is empty"));
        }
        if queue_id.is_empty() {
            return Err(RelayError::argument("queue id is empty"));
        }
        Ok(Self {
            peer_name,
            queue_id,
        })
    }

    /// Mint a new session for `peer_name` with a fresh random queue id.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Argument`] if `peer_name` is empty, or
    /// [`RelayError::Security`] if the system RNG fails.
    pub fn mint(peer_name: impl Into<String>) -> Result<Self> {
        let queue_id = relaygate_crypto::random::random_token()?;
        Self::new(peer_name, queue_id)
    }

    /// Name the provider side presents to the relay
    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Per-session queue id
    #[must_use]
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// The four queue names of this session
    #[must_use]
    pub fn queues(&self) -> QueueQuadruple {
        QueueQuadruple::for_session(self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer_name, self.queue_id)
    }
}

impl FromStr for SessionId {
    type Err = RelayError;

    /// Parses `peer/queue_id`. The queue id is everything after the last `/`.
    fn from_str(s: &str) -> Result<Self> {
        let (peer, queue) = s
            .rsplit_once('/')
            .ok_or_else(|| RelayError::argument(format!("expected <peer>/<queue-id>, got {s:?}")))?;
        Self::new(peer, queue)
    }
}

/// The four queues of one session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueQuadruple {
    /// Provider to consumer data
    pub request: String,
    /// Consumer to provider data
    pub response: String,
    /// Control queue paired with `request`
    pub request_control: String,
    /// Control queue paired with `response`
    pub response_control: String,
}

impl QueueQuadruple {
    /// Derive the queue names for `session`.
    #[must_use]
    pub fn for_session(session: &SessionId) -> Self {
        let request = format!(
            "{REQUEST_PREFIX}{}-{}",
            session.peer_name, session.queue_id
        );
        let response = format!(
            "{RESPONSE_PREFIX}{}-{}",
            session.peer_name, session.queue_id
        );
        Self {
            request_control: format!("{request}{CONTROL_SUFFIX}"),
            response_control: format!("{response}{CONTROL_SUFFIX}"),
            request,
            response,
        }
    }

    /// All four names, data queues first.
    #[must_use]
    pub fn names(&self) -> [&str; 4] {
        [
            &self.request,
            &self.response,
            &self.request_control,
            &self.response_control,
        ]
    }

    /// Returns true if `queue` is one of the two control queues
    #[must_use]
    pub fn is_control(&self, queue: &str) -> bool {
        queue == self.request_control || queue == self.response_control
    }
}
