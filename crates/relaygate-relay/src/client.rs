//! Broker client for connecting to relay servers.

use crate::broker::{Broker, BrokerConnector, DeliveryReceiver};
use crate::descriptor::RelayDescriptor;
use crate::error::{ErrorKind, RelayError, Result};
use crate::message::BrokerMessage;
use crate::protocol::{
    BrokerErrorCode, BrokerFrame, RequestId, SubscriptionId, read_frame, write_frame,
};
use crate::queues::{DEFAULT_DELIVERY_WINDOW, Delivery, delivery_channel_capacity};
use crate::{RELAY_CONNECT_TIMEOUT, RELAY_KEEPALIVE_INTERVAL};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Reply = oneshot::Sender<Result<Option<SubscriptionId>>>;

struct PendingRequest {
    reply: Reply,
    /// Route to install when a Subscribe is acknowledged
    deliveries: Option<mpsc::Sender<Delivery>>,
}

type PendingMap = DashMap<RequestId, PendingRequest>;
type RouteMap = DashMap<SubscriptionId, mpsc::Sender<Delivery>>;

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct RemoteBrokerConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time to wait for a request to be acknowledged
    pub request_timeout: Duration,
    /// Keepalive interval
    pub keepalive_interval: Duration,
    /// Unsettled deliveries the relay may push per subscription
    pub delivery_window: u32,
}

impl Default for RemoteBrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: RELAY_CONNECT_TIMEOUT,
            request_timeout: Duration::from_secs(10),
            keepalive_interval: RELAY_KEEPALIVE_INTERVAL,
            delivery_window: DEFAULT_DELIVERY_WINDOW,
        }
    }
}

/// Broker connection to a [`crate::RelayServer`].
///
/// A background reader dispatches acknowledgements to waiting requests and
/// deliveries to subscriptions in arrival order.
pub struct RemoteBroker {
    /// Relay server address
    relay_addr: SocketAddr,
    /// Name presented in Hello
    client_name: String,
    /// Connection is usable
    open: Arc<AtomicBool>,
    /// Frames to the writer task
    outbound: mpsc::UnboundedSender<BrokerFrame>,
    /// Requests awaiting Ack or Error
    pending: Arc<PendingMap>,
    /// Subscription routes
    routes: Arc<RouteMap>,
    /// Request id counter
    next_request: AtomicU64,
    /// Client configuration
    config: RemoteBrokerConfig,
    /// Stops the background tasks
    shutdown: CancellationToken,
}

impl RemoteBroker {
    /// Connect to a relay server and register as `client_name`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the connection or the Hello
    /// exchange fails or times out.
    pub async fn connect(
        addr: SocketAddr,
        client_name: impl Into<String>,
        config: RemoteBrokerConfig,
    ) -> Result<Arc<Self>> {
        let client_name = client_name.into();
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::transport(format!("connection to relay {addr} timed out")))??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let broker = Arc::new(Self {
            relay_addr: addr,
            client_name: client_name.clone(),
            open: Arc::new(AtomicBool::new(true)),
            outbound,
            pending: Arc::new(DashMap::new()),
            routes: Arc::new(DashMap::new()),
            next_request: AtomicU64::new(1),
            config,
            shutdown: CancellationToken::new(),
        });

        broker.spawn_writer(writer, outbound_rx);
        broker.spawn_receiver(reader);

        let request = broker.next_request_id();
        let hello = BrokerFrame::Hello {
            request,
            client_name,
        };
        if let Err(e) = broker.request(hello, None).await {
            broker.close().await;
            return Err(e);
        }

        broker.spawn_keepalive();
        debug!(relay = %addr, name = %broker.client_name, "Connected to relay");
        Ok(broker)
    }

    /// Get relay server address
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(
        &self,
        frame: BrokerFrame,
        deliveries: Option<mpsc::Sender<Delivery>>,
    ) -> Result<Option<SubscriptionId>> {
        let request = frame
            .request_id()
            .ok_or_else(|| RelayError::protocol("frame carries no request id"))?;
        let kind = frame.frame_type();
        if !self.is_open() {
            return Err(RelayError::transport(format!(
                "relay connection to {} closed",
                self.relay_addr
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.pending.insert(request, PendingRequest { reply, deliveries });
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&request);
            return Err(RelayError::transport("relay connection closed"));
        }

        match time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::transport("relay connection lost")),
            Err(_) => {
                self.pending.remove(&request);
                Err(RelayError::transport(format!("{kind} to {} timed out", self.relay_addr)))
            }
        }
    }

    fn spawn_writer(
        &self,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<BrokerFrame>,
    ) {
        let shutdown = self.shutdown.clone();
        let open = self.open.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        let last = matches!(frame, BrokerFrame::Disconnect);
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            debug!(error = %e, "Relay write failed");
                            open.store(false, Ordering::Release);
                            break;
                        }
                        if last {
                            break;
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Start background frame processing.
    fn spawn_receiver(&self, mut reader: OwnedReadHalf) {
        let shutdown = self.shutdown.clone();
        let open = self.open.clone();
        let pending = self.pending.clone();
        let routes = self.routes.clone();
        let relay = self.relay_addr;

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = shutdown.cancelled() => break,
                    frame = read_frame(&mut reader) => frame,
                };

                match frame {
                    Ok(Some(frame)) => dispatch(frame, &pending, &routes),
                    Ok(None) => {
                        debug!(%relay, "Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(%relay, error = %e, "Relay connection failed");
                        break;
                    }
                }
            }

            open.store(false, Ordering::Release);
            shutdown.cancel();
            let waiting: Vec<RequestId> = pending.iter().map(|p| *p.key()).collect();
            for request in waiting {
                if let Some((_, p)) = pending.remove(&request) {
                    let _ = p.reply.send(Err(RelayError::transport("relay connection lost")));
                }
            }
            routes.clear();
        });
    }

    fn spawn_keepalive(&self) {
        let shutdown = self.shutdown.clone();
        let outbound = self.outbound.clone();
        let interval = self.config.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if outbound.send(BrokerFrame::Keepalive).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

fn broker_error(code: BrokerErrorCode, message: String) -> RelayError {
    match RelayError::from(code) {
        RelayError::QueueFull(_) => RelayError::QueueFull(message.into()),
        err if err.kind() == ErrorKind::Protocol => RelayError::protocol(message),
        _ => RelayError::transport(message),
    }
}

fn dispatch(frame: BrokerFrame, pending: &PendingMap, routes: &RouteMap) {
    match frame {
        BrokerFrame::Ack {
            request,
            subscription,
        } => {
            let Some((_, waiting)) = pending.remove(&request) else {
                debug!(request, "Ack for unknown request");
                return;
            };
            if let (Some(subscription), Some(route)) = (subscription, waiting.deliveries) {
                routes.insert(subscription, route);
            }
            let _ = waiting.reply.send(Ok(subscription));
        }
        BrokerFrame::Error {
            request,
            code,
            message,
        } => match pending.remove(&request) {
            Some((_, waiting)) => {
                let _ = waiting.reply.send(Err(broker_error(code, message)));
            }
            None => warn!(?code, %message, "Relay error"),
        },
        BrokerFrame::Deliver {
            subscription,
            message,
        } => {
            let Some(route) = routes.get(&subscription).map(|r| r.value().clone()) else {
                debug!(subscription, "Delivery for dropped subscription");
                return;
            };
            match route.try_send(Delivery {
                subscription,
                message: Some(message),
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscription, "Relay overran the delivery window, dropping subscription");
                    routes.remove(&subscription);
                }
                Err(TrySendError::Closed(_)) => {
                    routes.remove(&subscription);
                }
            }
        }
        BrokerFrame::SubscriptionClosed { subscription } => {
            if let Some((_, route)) = routes.remove(&subscription) {
                let _ = route.try_send(Delivery {
                    subscription,
                    message: None,
                });
            }
        }
        other => debug!(frame = other.frame_type(), "Ignoring frame from relay"),
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn client_name(&self) -> &str {
        &self.client_name
    }

    async fn declare(&self, queue: &str) -> Result<()> {
        let request = self.next_request_id();
        self.request(
            BrokerFrame::Declare {
                request,
                queue: queue.to_string(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn subscribe(&self, queue: &str) -> Result<(SubscriptionId, DeliveryReceiver)> {
        let request = self.next_request_id();
        let window = self.config.delivery_window;
        let (tx, rx) = mpsc::channel(delivery_channel_capacity(window));
        let subscription = self
            .request(
                BrokerFrame::Subscribe {
                    request,
                    queue: queue.to_string(),
                    window,
                },
                Some(tx),
            )
            .await?
            .ok_or_else(|| RelayError::protocol("subscribe acknowledged without subscription"))?;
        Ok((subscription, rx))
    }

    fn settle(&self, _queue: &str, subscription: SubscriptionId, count: u32) {
        if self.is_open() && self.routes.contains_key(&subscription) {
            let _ = self.outbound.send(BrokerFrame::Settle {
                subscription,
                count,
            });
        }
    }

    async fn unsubscribe(&self, _queue: &str, subscription: SubscriptionId) -> Result<()> {
        self.routes.remove(&subscription);
        let request = self.next_request_id();
        self.request(
            BrokerFrame::Unsubscribe {
                request,
                subscription,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<()> {
        let request = self.next_request_id();
        self.request(
            BrokerFrame::Publish {
                request,
                queue: queue.to_string(),
                message,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let request = self.next_request_id();
        self.request(
            BrokerFrame::DeleteQueue {
                request,
                queue: queue.to_string(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(BrokerFrame::Disconnect);
            debug!(relay = %self.relay_addr, "Disconnected from relay");
        }
        self.routes.clear();
    }
}

impl Drop for RemoteBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connector opening [`RemoteBroker`] connections over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: RemoteBrokerConfig,
}

impl TcpConnector {
    /// Create a connector with the given client configuration
    #[must_use]
    pub fn new(config: RemoteBrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for TcpConnector {
    async fn connect(&self, relay: &RelayDescriptor, client_name: &str) -> Result<Arc<dyn Broker>> {
        relay.validate()?;
        let addr = tokio::net::lookup_host(relay.authority())
            .await?
            .next()
            .ok_or_else(|| RelayError::transport(format!("cannot resolve relay {relay}")))?;
        let broker = RemoteBroker::connect(addr, client_name, self.config.clone()).await?;
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Consumer, Producer};
    use crate::server::RelayServer;

    async fn start_relay() -> Arc<RelayServer> {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RemoteBroker::connect(addr, "gw", RemoteBrokerConfig::default()).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_publish_and_receive_through_relay() {
        let server = start_relay().await;
        let relay = RelayDescriptor::new("127.0.0.1", server.local_addr().port());
        let connector = TcpConnector::default();

        let provider = connector.connect(&relay, "provider").await.unwrap();
        let consumer_side = connector.connect(&relay, "consumer").await.unwrap();

        let producer = Producer::open(provider.clone(), "REQ-p-q").await.unwrap();
        producer.send(BrokerMessage::Bytes(b"one".to_vec())).await.unwrap();

        let mut consumer = Consumer::open(consumer_side.clone(), "REQ-p-q").await.unwrap();
        producer.send(BrokerMessage::Bytes(b"two".to_vec())).await.unwrap();

        assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(b"one".to_vec())));
        assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(b"two".to_vec())));

        producer.destroy().await.unwrap();
        assert_eq!(consumer.recv().await, None);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_delete_missing_queue_is_transport_error() {
        let server = start_relay().await;
        let broker = RemoteBroker::connect(server.local_addr(), "gw", RemoteBrokerConfig::default())
            .await
            .unwrap();

        let err = broker.delete_queue("nothing-here").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_relay_shutdown_closes_client() {
        let server = start_relay().await;
        let broker = RemoteBroker::connect(server.local_addr(), "gw", RemoteBrokerConfig::default())
            .await
            .unwrap();
        let (_, mut rx) = broker.subscribe("q").await.unwrap();
        assert!(broker.is_open());

        server.shutdown();
        assert!(time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());
        assert!(!broker.is_open());
    }

    #[tokio::test]
    async fn test_idle_reader_holds_messages_at_relay() {
        let server = start_relay().await;
        let config = RemoteBrokerConfig {
            delivery_window: 4,
            ..RemoteBrokerConfig::default()
        };
        let broker: Arc<dyn Broker> = RemoteBroker::connect(server.local_addr(), "gw", config)
            .await
            .unwrap();
        let producer = Producer::open(broker.clone(), "q").await.unwrap();
        let mut consumer = Consumer::open(broker.clone(), "q").await.unwrap();

        for i in 0..20u8 {
            producer.send(BrokerMessage::Bytes(vec![i])).await.unwrap();
        }
        assert_eq!(server.table().backlog_len("q"), 16);

        for i in 0..20u8 {
            assert_eq!(consumer.recv().await, Some(BrokerMessage::Bytes(vec![i])));
        }
        let drained = async {
            while server.table().backlog_len("q") > 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        };
        time::timeout(Duration::from_secs(5), drained).await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = start_relay().await;
        let broker = RemoteBroker::connect(server.local_addr(), "gw", RemoteBrokerConfig::default())
            .await
            .unwrap();

        broker.close().await;
        broker.close().await;
        assert!(!broker.is_open());
        assert!(broker.declare("q").await.is_err());
        server.shutdown();
    }
}
