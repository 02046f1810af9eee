//! In-process broker.
//!
//! Every [`MemoryBroker`] handle attached to the same [`QueueTable`] sees the
//! same queues, the way several TCP clients of one relay server would.
//! Closing a handle only affects that handle.

use crate::broker::{Broker, BrokerConnector, DeliveryReceiver};
use crate::descriptor::RelayDescriptor;
use crate::error::{RelayError, Result};
use crate::message::BrokerMessage;
use crate::protocol::SubscriptionId;
use crate::queues::{DEFAULT_DELIVERY_WINDOW, Delivery, QueueTable, delivery_channel_capacity};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One connection to an in-process queue table.
pub struct MemoryBroker {
    table: Arc<QueueTable>,
    client_name: String,
    open: AtomicBool,
    subscriptions: DashMap<SubscriptionId, String>,
    delivery_window: u32,
}

impl MemoryBroker {
    /// Attach a new connection to `table`.
    #[must_use]
    pub fn attach(table: Arc<QueueTable>, client_name: impl Into<String>) -> Self {
        Self {
            table,
            client_name: client_name.into(),
            open: AtomicBool::new(true),
            subscriptions: DashMap::new(),
            delivery_window: DEFAULT_DELIVERY_WINDOW,
        }
    }

    /// Use `window` unsettled deliveries per subscription.
    #[must_use]
    pub fn with_delivery_window(mut self, window: u32) -> Self {
        self.delivery_window = window;
        self
    }

    /// Create a broker with a private queue table.
    #[must_use]
    pub fn standalone(client_name: impl Into<String>) -> Self {
        Self::attach(Arc::new(QueueTable::default()), client_name)
    }

    /// Queue table behind this connection
    #[must_use]
    pub fn table(&self) -> &Arc<QueueTable> {
        &self.table
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RelayError::transport("broker connection closed"))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn client_name(&self) -> &str {
        &self.client_name
    }

    async fn declare(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.table.declare(queue);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<(SubscriptionId, DeliveryReceiver)> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel::<Delivery>(delivery_channel_capacity(self.delivery_window));
        let id = self.table.subscribe(queue, self.delivery_window, tx);
        self.subscriptions.insert(id, queue.to_string());
        Ok((id, rx))
    }

    fn settle(&self, queue: &str, subscription: SubscriptionId, count: u32) {
        if self.is_open() {
            self.table.settle(queue, subscription, count);
        }
    }

    async fn unsubscribe(&self, queue: &str, subscription: SubscriptionId) -> Result<()> {
        self.ensure_open()?;
        self.subscriptions.remove(&subscription);
        self.table.unsubscribe(queue, subscription);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<()> {
        self.ensure_open()?;
        self.table.publish(queue, message).map_err(RelayError::from)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.table.delete(queue).map_err(RelayError::from)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let subscriptions: Vec<(SubscriptionId, String)> = self
            .subscriptions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, queue) in subscriptions {
            self.table.unsubscribe(&queue, id);
        }
        self.subscriptions.clear();
    }
}

/// Connector handing out [`MemoryBroker`] connections, one queue table per
/// relay descriptor.
#[derive(Default)]
pub struct MemoryConnector {
    tables: DashMap<RelayDescriptor, Arc<QueueTable>>,
}

impl MemoryConnector {
    /// Create an empty connector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue table standing in for `relay`, created on first use
    #[must_use]
    pub fn table(&self, relay: &RelayDescriptor) -> Arc<QueueTable> {
        self.tables
            .entry(relay.clone())
            .or_insert_with(|| Arc::new(QueueTable::default()))
            .clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, relay: &RelayDescriptor, client_name: &str) -> Result<Arc<dyn Broker>> {
        relay.validate()?;
        Ok(Arc::new(MemoryBroker::attach(self.table(relay), client_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Consumer, Producer};
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::standalone("gw"));
        let producer = Producer::open(broker.clone(), "q").await.unwrap();
        let mut consumer = Consumer::open(broker.clone(), "q").await.unwrap();

        producer.send(BrokerMessage::Bytes(b"hi".to_vec())).await.unwrap();
        assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(b"hi".to_vec())));
    }

    #[tokio::test]
    async fn test_shared_table_between_handles() {
        let connector = MemoryConnector::new();
        let relay = RelayDescriptor::new("relay", 1);
        let a = connector.connect(&relay, "a").await.unwrap();
        let b = connector.connect(&relay, "b").await.unwrap();

        let mut consumer = Consumer::open(b.clone(), "q").await.unwrap();
        a.publish("q", BrokerMessage::Bytes(vec![1])).await.unwrap();
        assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(vec![1])));

        a.close().await;
        assert!(!a.is_open());
        assert!(b.is_open());
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_publish() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::standalone("gw"));
        let producer = Producer::open(broker.clone(), "q").await.unwrap();
        broker.close().await;

        let err = producer.send(BrokerMessage::Bytes(vec![])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_delete_ends_consumer() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::standalone("gw"));
        let producer = Producer::open(broker.clone(), "q").await.unwrap();
        let mut consumer = Consumer::open(broker.clone(), "q").await.unwrap();

        producer.destroy().await.unwrap();
        assert_eq!(consumer.recv().await, None);
        assert!(producer.destroy().await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::standalone("gw"));
        let consumer = Consumer::open(broker.clone(), "q").await.unwrap();

        consumer.unsubscribe().await;
        consumer.unsubscribe().await;
        broker.close().await;
        consumer.unsubscribe().await;
        assert!(consumer.is_closed());
    }

    #[tokio::test]
    async fn test_unread_subscription_stays_bounded() {
        let table = Arc::new(QueueTable::new(4));
        let broker: Arc<dyn Broker> =
            Arc::new(MemoryBroker::attach(table.clone(), "gw").with_delivery_window(2));
        let producer = Producer::open(broker.clone(), "q").await.unwrap();
        let mut consumer = Consumer::open(broker.clone(), "q").await.unwrap();

        for i in 0..6u8 {
            producer.send(BrokerMessage::Bytes(vec![i])).await.unwrap();
        }
        let err = producer.send(BrokerMessage::Bytes(vec![6])).await.unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(table.backlog_len("q"), 4);

        for i in 0..6u8 {
            assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(vec![i])));
        }
        assert_eq!(table.backlog_len("q"), 0);
        producer.send(BrokerMessage::Bytes(vec![7])).await.unwrap();
        assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(vec![7])));
    }

    #[tokio::test]
    async fn test_connector_rejects_bad_descriptor() {
        let connector = MemoryConnector::new();
        let result = connector.connect(&RelayDescriptor::new("", 1), "gw").await;
        assert!(result.is_err());
    }
}
