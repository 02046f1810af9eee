//! Broker wire protocol.
//!
//! Frames travel over TCP as a 4-byte big-endian length followed by the
//! bincode encoding of a [`BrokerFrame`]. Frames larger than
//! [`MAX_FRAME_SIZE`] are refused by both ends.

use crate::MAX_FRAME_SIZE;
use crate::error::{RelayError, Result};
use crate::message::BrokerMessage;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client-chosen request correlation id
pub type RequestId = u64;

/// Server-assigned subscription id
pub type SubscriptionId = u64;

/// Broker protocol frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BrokerFrame {
    /// Client introduces itself
    Hello {
        /// Request id
        request: RequestId,
        /// Name the client presents to the relay
        client_name: String,
    },

    /// Client subscribes to a queue, creating it if needed
    Subscribe {
        /// Request id
        request: RequestId,
        /// Queue name
        queue: String,
        /// Unsettled deliveries the client accepts before the relay holds
        /// further messages back
        window: u32,
    },

    /// Client has consumed `count` deliveries of a subscription. Not
    /// acknowledged.
    Settle {
        /// Subscription the deliveries belong to
        subscription: SubscriptionId,
        /// Number of deliveries consumed
        count: u32,
    },

    /// Client drops a subscription
    Unsubscribe {
        /// Request id
        request: RequestId,
        /// Subscription to drop
        subscription: SubscriptionId,
    },

    /// Client declares a queue without subscribing
    Declare {
        /// Request id
        request: RequestId,
        /// Queue name
        queue: String,
    },

    /// Client publishes one message
    Publish {
        /// Request id
        request: RequestId,
        /// Destination queue
        queue: String,
        /// Message
        message: BrokerMessage,
    },

    /// Client removes a queue and every subscription on it
    DeleteQueue {
        /// Request id
        request: RequestId,
        /// Queue name
        queue: String,
    },

    /// Keepalive (no payload)
    Keepalive,

    /// Client disconnects
    Disconnect,

    /// Request succeeded
    Ack {
        /// Request being acknowledged
        request: RequestId,
        /// Subscription created by a `Subscribe` request
        subscription: Option<SubscriptionId>,
    },

    /// Request failed
    Error {
        /// Request that failed (0 for connection-level errors)
        request: RequestId,
        /// Error code
        code: BrokerErrorCode,
        /// Human-readable error message
        message: String,
    },

    /// Server delivers a message for a subscription
    Deliver {
        /// Subscription the message belongs to
        subscription: SubscriptionId,
        /// Message
        message: BrokerMessage,
    },

    /// Subscription ended because its queue was deleted
    SubscriptionClosed {
        /// Subscription that ended
        subscription: SubscriptionId,
    },
}

/// Broker error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerErrorCode {
    /// Client has not sent Hello
    NotRegistered = 1,
    /// Queue does not exist
    QueueNotFound = 2,
    /// Queue backlog is full
    QueueFull = 3,
    /// Invalid frame
    InvalidMessage = 4,
    /// Server at capacity
    ServerFull = 5,
    /// Subscription does not exist
    UnknownSubscription = 6,
    /// Internal server error
    InternalError = 7,
}

impl BrokerFrame {
    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the frame type name
    pub fn frame_type(&self) -> &'static str {
        match self {
            BrokerFrame::Hello { .. } => "Hello",
            BrokerFrame::Subscribe { .. } => "Subscribe",
            BrokerFrame::Settle { .. } => "Settle",
            BrokerFrame::Unsubscribe { .. } => "Unsubscribe",
            BrokerFrame::Declare { .. } => "Declare",
            BrokerFrame::Publish { .. } => "Publish",
            BrokerFrame::DeleteQueue { .. } => "DeleteQueue",
            BrokerFrame::Keepalive => "Keepalive",
            BrokerFrame::Disconnect => "Disconnect",
            BrokerFrame::Ack { .. } => "Ack",
            BrokerFrame::Error { .. } => "Error",
            BrokerFrame::Deliver { .. } => "Deliver",
            BrokerFrame::SubscriptionClosed { .. } => "SubscriptionClosed",
        }
    }

    /// Request id carried by a client request, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            BrokerFrame::Hello { request, .. }
            | BrokerFrame::Subscribe { request, .. }
            | BrokerFrame::Unsubscribe { request, .. }
            | BrokerFrame::Declare { request, .. }
            | BrokerFrame::Publish { request, .. }
            | BrokerFrame::DeleteQueue { request, .. } => Some(*request),
            _ => None,
        }
    }
}

impl From<BrokerErrorCode> for RelayError {
    fn from(code: BrokerErrorCode) -> Self {
        match code {
            BrokerErrorCode::NotRegistered => RelayError::transport("client not registered"),
            BrokerErrorCode::QueueNotFound => RelayError::transport("queue not found"),
            BrokerErrorCode::QueueFull => RelayError::QueueFull("queue full".into()),
            BrokerErrorCode::InvalidMessage => RelayError::protocol("broker rejected frame"),
            BrokerErrorCode::ServerFull => RelayError::transport("relay at capacity"),
            BrokerErrorCode::UnknownSubscription => {
                RelayError::transport("unknown subscription")
            }
            BrokerErrorCode::InternalError => RelayError::transport("relay internal error"),
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &BrokerFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(RelayError::protocol(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    let len = u32::try_from(bytes.len())
        .map_err(|_| RelayError::protocol("frame length overflow"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a length prefix.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<BrokerFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    BrokerFrame::from_bytes(&buf).map(Some)
}
