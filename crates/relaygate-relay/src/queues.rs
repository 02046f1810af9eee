//! Broker-side queue table shared by the relay server and the in-memory broker.
//!
//! Each queue holds a backlog and a list of subscribers served round-robin.
//! A subscriber has a delivery window: at most `window` messages may be
//! delivered to it and not yet settled. Once every subscriber's window is
//! full, new messages wait in the backlog, which is capped at the table's
//! maximum depth. Settling a delivery reopens the window and flushes the
//! backlog. Deliveries go out through a [`DeliverySink`].

use crate::message::BrokerMessage;
use crate::protocol::{BrokerErrorCode, SubscriptionId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Default per-queue backlog limit
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;

/// Default number of unsettled deliveries per subscription
pub const DEFAULT_DELIVERY_WINDOW: u32 = 256;

/// Largest delivery window a subscriber may ask for
pub const MAX_DELIVERY_WINDOW: u32 = 4096;

/// Event for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Subscription the event belongs to
    pub subscription: SubscriptionId,
    /// Message, or `None` once the queue has been deleted
    pub message: Option<BrokerMessage>,
}

/// Destination of a subscription's deliveries.
pub trait DeliverySink: Send + Sync + 'static {
    /// Push one delivery, handing it back if the receiving side cannot take
    /// it any more.
    fn deliver(&self, delivery: Delivery) -> Result<(), Delivery>;
}

impl DeliverySink for mpsc::Sender<Delivery> {
    fn deliver(&self, delivery: Delivery) -> Result<(), Delivery> {
        self.try_send(delivery).map_err(|e| e.into_inner())
    }
}

/// Channel capacity for a subscription with `window`: every in-window
/// message plus the end-of-queue notice.
#[must_use]
pub fn delivery_channel_capacity(window: u32) -> usize {
    clamp_window(window) as usize + 1
}

fn clamp_window(window: u32) -> u32 {
    window.clamp(1, MAX_DELIVERY_WINDOW)
}

struct Subscriber {
    id: SubscriptionId,
    sink: Box<dyn DeliverySink>,
    window: u32,
    unsettled: u32,
}

impl Subscriber {
    fn has_credit(&self) -> bool {
        self.unsettled < self.window
    }
}

#[derive(Default)]
struct QueueState {
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<BrokerMessage>,
    next: usize,
}

impl QueueState {
    /// Hand `message` to the next subscriber with an open window, pruning
    /// dead ones. Gives the message back if nobody can take it.
    fn dispatch(&mut self, mut message: BrokerMessage) -> Option<BrokerMessage> {
        let mut tried = 0;
        while tried < self.subscribers.len() {
            let index = (self.next + tried) % self.subscribers.len();
            let subscriber = &mut self.subscribers[index];
            if !subscriber.has_credit() {
                tried += 1;
                continue;
            }
            match subscriber.sink.deliver(Delivery {
                subscription: subscriber.id,
                message: Some(message),
            }) {
                Ok(()) => {
                    subscriber.unsettled += 1;
                    self.next = index + 1;
                    return None;
                }
                Err(returned) => {
                    self.subscribers.remove(index);
                    message = returned.message?;
                }
            }
        }
        Some(message)
    }

    /// Move backlog to subscribers while any window is open.
    fn flush(&mut self) {
        while let Some(message) = self.backlog.pop_front() {
            if let Some(undelivered) = self.dispatch(message) {
                self.backlog.push_front(undelivered);
                break;
            }
        }
    }
}

/// Concurrent queue table.
pub struct QueueTable {
    queues: DashMap<String, QueueState>,
    next_subscription: AtomicU64,
    max_depth: usize,
}

impl QueueTable {
    /// Create a table with the given backlog limit.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            queues: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            max_depth,
        }
    }

    /// Allocate a subscription id ahead of [`QueueTable::subscribe_with_id`].
    pub fn allocate_subscription(&self) -> SubscriptionId {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    /// Create `queue` if missing. Returns true if it was created.
    pub fn declare(&self, queue: &str) -> bool {
        if self.queues.contains_key(queue) {
            return false;
        }
        let mut created = false;
        self.queues.entry(queue.to_string()).or_insert_with(|| {
            created = true;
            QueueState::default()
        });
        created
    }

    /// Subscribe `sink` to `queue`, creating the queue if needed.
    pub fn subscribe(&self, queue: &str, window: u32, sink: impl DeliverySink) -> SubscriptionId {
        let id = self.allocate_subscription();
        self.subscribe_with_id(queue, id, window, sink);
        id
    }

    /// Subscribe with a previously allocated id. Backlog that fits the new
    /// subscriber's window is flushed to it before this returns.
    ///
    /// `window` is clamped to `1..=MAX_DELIVERY_WINDOW`.
    pub fn subscribe_with_id(
        &self,
        queue: &str,
        id: SubscriptionId,
        window: u32,
        sink: impl DeliverySink,
    ) {
        let mut state = self.queues.entry(queue.to_string()).or_default();
        state.subscribers.push(Subscriber {
            id,
            sink: Box::new(sink),
            window: clamp_window(window),
            unsettled: 0,
        });
        state.flush();
    }

    /// Drop subscription `id` from `queue`. Returns true if it existed.
    pub fn unsubscribe(&self, queue: &str, id: SubscriptionId) -> bool {
        let Some(mut state) = self.queues.get_mut(queue) else {
            return false;
        };
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        before != state.subscribers.len()
    }

    /// Mark `count` deliveries of subscription `id` as consumed and flush
    /// the backlog into the reopened window. Returns false if the
    /// subscription is unknown.
    pub fn settle(&self, queue: &str, id: SubscriptionId, count: u32) -> bool {
        let Some(mut state) = self.queues.get_mut(queue) else {
            return false;
        };
        let Some(subscriber) = state.subscribers.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        subscriber.unsettled = subscriber.unsettled.saturating_sub(count);
        state.flush();
        true
    }

    /// Publish to `queue`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerErrorCode::QueueFull`] if no subscriber has room in
    /// its window and the backlog is at its limit.
    pub fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerErrorCode> {
        let mut state = self.queues.entry(queue.to_string()).or_default();
        state.flush();
        let undelivered = if state.backlog.is_empty() {
            state.dispatch(message)
        } else {
            Some(message)
        };
        if let Some(undelivered) = undelivered {
            if state.backlog.len() >= self.max_depth {
                return Err(BrokerErrorCode::QueueFull);
            }
            state.backlog.push_back(undelivered);
        }
        Ok(())
    }

    /// Delete `queue`, closing every subscription on it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerErrorCode::QueueNotFound`] if the queue does not exist.
    pub fn delete(&self, queue: &str) -> Result<(), BrokerErrorCode> {
        let (_, state) = self
            .queues
            .remove(queue)
            .ok_or(BrokerErrorCode::QueueNotFound)?;
        for subscriber in state.subscribers {
            let _ = subscriber.sink.deliver(Delivery {
                subscription: subscriber.id,
                message: None,
            });
        }
        Ok(())
    }

    /// Returns true if `queue` exists
    #[must_use]
    pub fn contains(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Number of buffered messages on `queue`
    #[must_use]
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    /// Number of subscribers on `queue`
    #[must_use]
    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.subscribers.len())
    }

    /// Number of queues
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Returns true if there are no queues
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Snapshot of queue names
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.key().clone()).collect()
    }
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(b: &[u8]) -> BrokerMessage {
        BrokerMessage::Bytes(b.to_vec())
    }

    fn channel(window: u32) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
        mpsc::channel(delivery_channel_capacity(window))
    }

    #[test]
    fn test_backlog_flushed_on_subscribe() {
        let table = QueueTable::default();
        table.publish("q", bytes(b"1")).unwrap();
        table.publish("q", bytes(b"2")).unwrap();
        assert_eq!(table.backlog_len("q"), 2);

        let (tx, mut rx) = channel(DEFAULT_DELIVERY_WINDOW);
        let id = table.subscribe("q", DEFAULT_DELIVERY_WINDOW, tx);

        assert_eq!(rx.try_recv().unwrap(), Delivery { subscription: id, message: Some(bytes(b"1")) });
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(b"2")));
        assert_eq!(table.backlog_len("q"), 0);
    }

    #[test]
    fn test_round_robin() {
        let table = QueueTable::default();
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);
        table.subscribe("q", 8, tx_a);
        table.subscribe("q", 8, tx_b);

        for i in 0..4u8 {
            table.publish("q", bytes(&[i])).unwrap();
        }

        assert_eq!(rx_a.try_recv().unwrap().message, Some(bytes(&[0])));
        assert_eq!(rx_b.try_recv().unwrap().message, Some(bytes(&[1])));
        assert_eq!(rx_a.try_recv().unwrap().message, Some(bytes(&[2])));
        assert_eq!(rx_b.try_recv().unwrap().message, Some(bytes(&[3])));
    }

    #[test]
    fn test_dead_subscriber_pruned() {
        let table = QueueTable::default();
        let (tx, rx) = channel(4);
        table.subscribe("q", 4, tx);
        drop(rx);

        table.publish("q", bytes(b"kept")).unwrap();
        assert_eq!(table.subscriber_count("q"), 0);
        assert_eq!(table.backlog_len("q"), 1);
    }

    #[test]
    fn test_queue_full() {
        let table = QueueTable::new(1);
        table.publish("q", bytes(b"1")).unwrap();
        assert_eq!(table.publish("q", bytes(b"2")), Err(BrokerErrorCode::QueueFull));
    }

    #[test]
    fn test_window_holds_back_unread_messages() {
        let table = QueueTable::new(3);
        let (tx, mut rx) = channel(2);
        let id = table.subscribe("q", 2, tx);

        for i in 0..5u8 {
            table.publish("q", bytes(&[i])).unwrap();
        }
        assert_eq!(table.backlog_len("q"), 3);
        assert_eq!(table.publish("q", bytes(b"over")), Err(BrokerErrorCode::QueueFull));

        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(&[0])));
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(&[1])));
        assert!(rx.try_recv().is_err());

        assert!(table.settle("q", id, 2));
        assert_eq!(table.backlog_len("q"), 1);
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(&[2])));
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(&[3])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_keeps_order_behind_backlog() {
        let table = QueueTable::default();
        let (tx, mut rx) = channel(1);
        let id = table.subscribe("q", 1, tx);

        table.publish("q", bytes(b"a")).unwrap();
        table.publish("q", bytes(b"b")).unwrap();
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(b"a")));
        table.settle("q", id, 1);
        table.publish("q", bytes(b"c")).unwrap();

        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(b"b")));
        table.settle("q", id, 1);
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(b"c")));
        assert!(!table.settle("q", 999, 1));
    }

    #[test]
    fn test_delete_closes_subscriptions() {
        let table = QueueTable::default();
        let (tx, mut rx) = channel(1);
        let id = table.subscribe("q", 1, tx);
        table.publish("q", bytes(b"x")).unwrap();

        table.delete("q").unwrap();
        assert_eq!(rx.try_recv().unwrap().message, Some(bytes(b"x")));
        assert_eq!(rx.try_recv().unwrap(), Delivery { subscription: id, message: None });
        assert!(!table.contains("q"));
        assert_eq!(table.delete("q"), Err(BrokerErrorCode::QueueNotFound));
    }

    #[test]
    fn test_declare_and_unsubscribe() {
        let table = QueueTable::default();
        assert!(table.declare("q"));
        assert!(!table.declare("q"));

        let (tx, _rx) = channel(4);
        let id = table.subscribe("q", 4, tx);
        assert!(table.unsubscribe("q", id));
        assert!(!table.unsubscribe("q", id));
        assert_eq!(table.len(), 1);
    }
}
