//! Messages as the broker carries them.

use serde::{Deserialize, Serialize};

/// One broker message.
///
/// Gateways publish [`BrokerMessage::Bytes`]. Text messages carrying the
/// base64 form of an envelope are accepted on receipt for brokers that only
/// pass text. Advisories are broker-originated notices with no payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessage {
    /// Binary payload
    Bytes(Vec<u8>),
    /// Text payload (base64 of the binary form)
    Text(String),
    /// Broker notice without a gateway payload
    Advisory {
        /// Notice topic
        topic: String,
        /// Human-readable detail
        detail: String,
    },
}

impl BrokerMessage {
    /// Payload size in bytes, zero for advisories
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            BrokerMessage::Bytes(bytes) => bytes.len(),
            BrokerMessage::Text(text) => text.len(),
            BrokerMessage::Advisory { .. } => 0,
        }
    }

    /// Message kind for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerMessage::Bytes(_) => "bytes",
            BrokerMessage::Text(_) => "text",
            BrokerMessage::Advisory { .. } => "advisory",
        }
    }
}

impl From<Vec<u8>> for BrokerMessage {
    fn from(bytes: Vec<u8>) -> Self {
        BrokerMessage::Bytes(bytes)
    }
}
