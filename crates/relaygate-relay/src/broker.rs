//! Broker capability seam.
//!
//! [`Broker`] is the minimal publish/subscribe surface the gateway needs
//! from a relay. [`Producer`] and [`Consumer`] are per-queue handles built
//! on top of it and are owned exclusively by one worker.
//!
//! Subscriptions are flow controlled. The relay stops delivering to a
//! subscription once it holds a window of unsettled messages, and a
//! [`Consumer`] settles each message as it hands it out. A reader that stops
//! reading therefore parks messages in the relay's bounded backlog rather
//! than in gateway memory.

use crate::descriptor::RelayDescriptor;
use crate::error::{RelayError, Result};
use crate::message::BrokerMessage;
use crate::protocol::SubscriptionId;
use crate::queues::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Receiving half of a subscription
pub type DeliveryReceiver = mpsc::Receiver<Delivery>;

/// Publish/subscribe broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns true while the connection can carry traffic
    fn is_open(&self) -> bool;

    /// Name this connection presented to the relay
    fn client_name(&self) -> &str;

    /// Create `queue` if it does not exist
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Subscribe to `queue`, creating it if needed
    async fn subscribe(&self, queue: &str) -> Result<(SubscriptionId, DeliveryReceiver)>;

    /// Report `count` messages of `subscription` as consumed, reopening its
    /// delivery window. Best effort; a lost connection ends the
    /// subscription anyway.
    fn settle(&self, queue: &str, subscription: SubscriptionId, count: u32);

    /// Drop a subscription
    async fn unsubscribe(&self, queue: &str, subscription: SubscriptionId) -> Result<()>;

    /// Publish one message to `queue`
    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<()>;

    /// Physically remove `queue`. Fails if it does not exist.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Close the connection
    async fn close(&self);
}

/// Opens broker connections by relay descriptor.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to `relay`, presenting `client_name`
    async fn connect(&self, relay: &RelayDescriptor, client_name: &str) -> Result<Arc<dyn Broker>>;
}

/// Sending handle for one queue.
#[derive(Clone)]
pub struct Producer {
    queue: String,
    broker: Arc<dyn Broker>,
}

impl Producer {
    /// Declare `queue` and return a producer for it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the broker refuses the queue.
    pub async fn open(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        broker.declare(&queue).await?;
        Ok(Self { queue, broker })
    }

    /// Queue this producer sends to
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns true while the underlying connection is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.broker.is_open()
    }

    /// Publish one message.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the connection is closed or the
    /// broker rejects the message.
    pub async fn send(&self, message: BrokerMessage) -> Result<()> {
        if !self.broker.is_open() {
            return Err(RelayError::transport(format!(
                "broker connection closed, cannot publish to {}",
                self.queue
            )));
        }
        self.broker.publish(&self.queue, message).await
    }

    /// Physically remove the queue.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the queue could not be removed.
    pub async fn destroy(&self) -> Result<()> {
        self.broker.delete_queue(&self.queue).await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").field("queue", &self.queue).finish()
    }
}

/// Receiving handle for one queue.
pub struct Consumer {
    queue: String,
    subscription: SubscriptionId,
    rx: DeliveryReceiver,
    broker: Arc<dyn Broker>,
    closed: AtomicBool,
}

impl Consumer {
    /// Subscribe to `queue` and return a consumer for it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the subscription fails.
    pub async fn open(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        let (subscription, rx) = broker.subscribe(&queue).await?;
        Ok(Self {
            queue,
            subscription,
            rx,
            broker,
            closed: AtomicBool::new(false),
        })
    }

    /// Queue this consumer reads from
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next message. `None` once the queue is deleted, the subscription is
    /// dropped or the connection is lost.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        let delivery = self.rx.recv().await?;
        self.take(delivery)
    }

    /// Next already-delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<BrokerMessage> {
        let delivery = self.rx.try_recv().ok()?;
        self.take(delivery)
    }

    fn take(&self, delivery: Delivery) -> Option<BrokerMessage> {
        let message = delivery.message?;
        if !self.is_closed() {
            self.broker.settle(&self.queue, self.subscription, 1);
        }
        Some(message)
    }

    /// Returns true once [`Consumer::unsubscribe`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the subscription. Idempotent and infallible; failures on an
    /// already-gone connection are logged and ignored.
    pub async fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.broker.is_open() {
            return;
        }
        if let Err(e) = self.broker.unsubscribe(&self.queue, self.subscription).await {
            tracing::debug!(queue = %self.queue, error = %e, "Unsubscribe ignored");
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
