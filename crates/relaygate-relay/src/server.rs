//! Relay broker server.
//!
//! A TCP queue broker. Gateways on both sides of a tunnel connect, publish
//! sealed envelopes to session queues and subscribe to the queues addressed
//! to them. The server never sees plaintext.

use crate::error::Result;
use crate::protocol::{
    BrokerErrorCode, BrokerFrame, RequestId, SubscriptionId, read_frame, write_frame,
};
use crate::queues::{DEFAULT_MAX_QUEUE_DEPTH, Delivery, DeliverySink, QueueTable};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ConnectionId = u64;

/// Connected client information
#[derive(Debug)]
struct ClientConnection {
    /// Client's socket address
    addr: SocketAddr,
    /// Name from Hello, `None` until registered
    name: Option<String>,
    /// Live subscriptions of this connection
    subscriptions: HashMap<SubscriptionId, String>,
    /// Last seen time
    last_seen: Instant,
    /// Stops the connection tasks
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a new client connection
    fn new(addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            addr,
            name: None,
            subscriptions: HashMap::new(),
            last_seen: Instant::now(),
            cancel,
        }
    }

    /// Update last seen time
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Check if connection is alive
    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

impl DeliverySink for mpsc::UnboundedSender<BrokerFrame> {
    fn deliver(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        let subscription = delivery.subscription;
        let frame = match delivery.message {
            Some(message) => BrokerFrame::Deliver {
                subscription,
                message,
            },
            None => BrokerFrame::SubscriptionClosed { subscription },
        };
        self.send(frame).map_err(|e| Delivery {
            subscription,
            message: match e.0 {
                BrokerFrame::Deliver { message, .. } => Some(message),
                _ => None,
            },
        })
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Messages buffered per queue while nobody is subscribed
    pub max_queue_depth: usize,
    /// Client timeout duration
    pub client_timeout: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

struct Shared {
    table: Arc<QueueTable>,
    clients: DashMap<ConnectionId, ClientConnection>,
    config: RelayServerConfig,
}

/// Queue broker relay server
pub struct RelayServer {
    /// Bound address
    local_addr: SocketAddr,
    /// TCP listener
    listener: TcpListener,
    /// State shared with connection tasks
    shared: Arc<Shared>,
    /// Server relay ID
    relay_id: [u8; 16],
    /// Connection id counter
    next_connection: AtomicU64,
    /// Stops the accept loop and every connection
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create a new relay server
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(bind_addr, RelayServerConfig::default()).await
    }

    /// Create a new relay server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(bind_addr: SocketAddr, config: RelayServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let relay_id = {
            let mut id = [0u8; 16];
            use rand::Rng;
            rand::thread_rng().fill(&mut id[..]);
            id
        };

        Ok(Self {
            local_addr,
            listener,
            shared: Arc::new(Shared {
                table: Arc::new(QueueTable::new(config.max_queue_depth)),
                clients: DashMap::new(),
                config,
            }),
            relay_id,
            next_connection: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run the relay server until [`RelayServer::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns error if the listener fails.
    pub async fn run(&self) -> Result<()> {
        info!(
            addr = %self.local_addr,
            relay_id = %hex::encode(&self.relay_id[..8]),
            "Relay server listening"
        );

        self.spawn_cleanup_task();

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if self.shared.clients.len() >= self.shared.config.max_clients {
                        warn!(%addr, "Relay at capacity, refusing connection");
                        tokio::spawn(refuse(stream));
                        continue;
                    }
                    let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    let cancel = self.shutdown.child_token();
                    self.shared
                        .clients
                        .insert(id, ClientConnection::new(addr, cancel.clone()));
                    tokio::spawn(serve_connection(self.shared.clone(), id, stream, cancel));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }

        info!(addr = %self.local_addr, "Relay server stopped");
        Ok(())
    }

    /// Stop accepting and drop every connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawn cleanup task to drop silent clients
    fn spawn_cleanup_task(&self) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let timeout = shared.config.client_timeout;
        let interval = shared.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for client in shared.clients.iter() {
                    if !client.is_alive(timeout) {
                        debug!(addr = %client.addr, name = ?client.name, "Dropping silent relay client");
                        client.cancel.cancel();
                    }
                }
            }
        });
    }

    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get number of connected clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Queue table served by this relay
    #[must_use]
    pub fn table(&self) -> &Arc<QueueTable> {
        &self.shared.table
    }

    /// Get server relay ID
    #[must_use]
    pub fn relay_id(&self) -> [u8; 16] {
        self.relay_id
    }
}

async fn refuse(mut stream: TcpStream) {
    let frame = BrokerFrame::Error {
        request: 0,
        code: BrokerErrorCode::ServerFull,
        message: "Server at capacity".to_string(),
    };
    let _ = write_frame(&mut stream, &frame).await;
}

async fn serve_connection(
    shared: Arc<Shared>,
    id: ConnectionId,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    // Deliveries queued here are capped by each subscription's window.
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerFrame>();

    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(error = %e, "Relay write failed");
                        break;
                    }
                }
                () = writer_cancel.cancelled() => break,
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                if !handle_frame(&shared, id, frame, &tx) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(connection = id, error = %e, "Relay read failed");
                break;
            }
        }
    }

    if let Some((_, client)) = shared.clients.remove(&id) {
        for (subscription, queue) in client.subscriptions {
            shared.table.unsubscribe(&queue, subscription);
        }
        debug!(addr = %client.addr, name = ?client.name, "Relay client disconnected");
    }
    drop(tx);
    cancel.cancel();
    let _ = writer_task.await;
}

fn ack(tx: &mpsc::UnboundedSender<BrokerFrame>, request: RequestId) {
    let _ = tx.send(BrokerFrame::Ack {
        request,
        subscription: None,
    });
}

fn send_error(
    tx: &mpsc::UnboundedSender<BrokerFrame>,
    request: RequestId,
    code: BrokerErrorCode,
    message: impl Into<String>,
) {
    let _ = tx.send(BrokerFrame::Error {
        request,
        code,
        message: message.into(),
    });
}

/// Handle one client frame. Returns false when the connection should end.
fn handle_frame(
    shared: &Shared,
    id: ConnectionId,
    frame: BrokerFrame,
    tx: &mpsc::UnboundedSender<BrokerFrame>,
) -> bool {
    let registered = {
        let Some(mut client) = shared.clients.get_mut(&id) else {
            return false;
        };
        client.touch();
        if let BrokerFrame::Hello { request, client_name } = &frame {
            debug!(addr = %client.addr, name = %client_name, "Relay client registered");
            client.name = Some(client_name.clone());
            ack(tx, *request);
            return true;
        }
        client.name.is_some()
    };

    match frame {
        BrokerFrame::Keepalive => {}
        BrokerFrame::Disconnect => return false,
        other if !registered => {
            send_error(
                tx,
                other.request_id().unwrap_or(0),
                BrokerErrorCode::NotRegistered,
                "Hello required",
            );
        }
        BrokerFrame::Subscribe {
            request,
            queue,
            window,
        } => {
            let subscription = shared.table.allocate_subscription();
            if let Some(mut client) = shared.clients.get_mut(&id) {
                client.subscriptions.insert(subscription, queue.clone());
            }
            // The Ack must precede any backlog flushed by subscribe_with_id.
            let _ = tx.send(BrokerFrame::Ack {
                request,
                subscription: Some(subscription),
            });
            shared
                .table
                .subscribe_with_id(&queue, subscription, window, tx.clone());
        }
        BrokerFrame::Settle {
            subscription,
            count,
        } => {
            let queue = shared
                .clients
                .get(&id)
                .and_then(|client| client.subscriptions.get(&subscription).cloned());
            match queue {
                Some(queue) => {
                    shared.table.settle(&queue, subscription, count);
                }
                None => debug!(connection = id, subscription, "Settle for unknown subscription"),
            }
        }
        BrokerFrame::Unsubscribe {
            request,
            subscription,
        } => {
            let queue = shared
                .clients
                .get_mut(&id)
                .and_then(|mut client| client.subscriptions.remove(&subscription));
            match queue {
                Some(queue) => {
                    shared.table.unsubscribe(&queue, subscription);
                    ack(tx, request);
                }
                None => send_error(
                    tx,
                    request,
                    BrokerErrorCode::UnknownSubscription,
                    format!("unknown subscription {subscription}"),
                ),
            }
        }
        BrokerFrame::Declare { request, queue } => {
            shared.table.declare(&queue);
            ack(tx, request);
        }
        BrokerFrame::Publish {
            request,
            queue,
            message,
        } => match shared.table.publish(&queue, message) {
            Ok(()) => ack(tx, request),
            Err(code) => send_error(tx, request, code, format!("cannot publish to {queue}")),
        },
        BrokerFrame::DeleteQueue { request, queue } => match shared.table.delete(&queue) {
            Ok(()) => ack(tx, request),
            Err(code) => send_error(tx, request, code, format!("no such queue {queue}")),
        },
        other => {
            send_error(
                tx,
                other.request_id().unwrap_or(0),
                BrokerErrorCode::InvalidMessage,
                format!("unexpected {} from client", other.frame_type()),
            );
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BrokerMessage;

    async fn start() -> Arc<RelayServer> {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    async fn raw_client(server: &RelayServer) -> TcpStream {
        TcpStream::connect(server.local_addr()).await.unwrap()
    }

    async fn exchange(stream: &mut TcpStream, frame: BrokerFrame) -> BrokerFrame {
        write_frame(stream, &frame).await.unwrap();
        read_frame(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_relay_server_creation() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_hello_required() {
        let server = start().await;
        let mut stream = raw_client(&server).await;

        let reply = exchange(
            &mut stream,
            BrokerFrame::Declare {
                request: 1,
                queue: "q".to_string(),
            },
        )
        .await;
        assert!(matches!(
            reply,
            BrokerFrame::Error {
                request: 1,
                code: BrokerErrorCode::NotRegistered,
                ..
            }
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_backlog_delivered_after_ack() {
        let server = start().await;
        let mut stream = raw_client(&server).await;

        let hello = BrokerFrame::Hello {
            request: 1,
            client_name: "gw".to_string(),
        };
        assert!(matches!(exchange(&mut stream, hello).await, BrokerFrame::Ack { request: 1, .. }));

        let publish = BrokerFrame::Publish {
            request: 2,
            queue: "q".to_string(),
            message: BrokerMessage::Bytes(vec![9]),
        };
        assert!(matches!(exchange(&mut stream, publish).await, BrokerFrame::Ack { request: 2, .. }));

        let subscribe = BrokerFrame::Subscribe {
            request: 3,
            queue: "q".to_string(),
            window: 8,
        };
        let BrokerFrame::Ack {
            request: 3,
            subscription: Some(subscription),
        } = exchange(&mut stream, subscribe).await
        else {
            panic!("expected subscribe ack");
        };

        let delivered = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(
            delivered,
            BrokerFrame::Deliver {
                subscription,
                message: BrokerMessage::Bytes(vec![9]),
            }
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_delete_missing_queue() {
        let server = start().await;
        let mut stream = raw_client(&server).await;
        exchange(
            &mut stream,
            BrokerFrame::Hello {
                request: 1,
                client_name: "gw".to_string(),
            },
        )
        .await;

        let reply = exchange(
            &mut stream,
            BrokerFrame::DeleteQueue {
                request: 2,
                queue: "missing".to_string(),
            },
        )
        .await;
        assert!(matches!(
            reply,
            BrokerFrame::Error {
                code: BrokerErrorCode::QueueNotFound,
                ..
            }
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_settle_releases_held_deliveries() {
        let server = start().await;
        let mut stream = raw_client(&server).await;
        exchange(
            &mut stream,
            BrokerFrame::Hello {
                request: 1,
                client_name: "gw".to_string(),
            },
        )
        .await;
        let BrokerFrame::Ack {
            subscription: Some(subscription),
            ..
        } = exchange(
            &mut stream,
            BrokerFrame::Subscribe {
                request: 2,
                queue: "q".to_string(),
                window: 1,
            },
        )
        .await
        else {
            panic!("expected subscribe ack");
        };

        for (request, byte) in [(3u64, 1u8), (4, 2)] {
            write_frame(
                &mut stream,
                &BrokerFrame::Publish {
                    request,
                    queue: "q".to_string(),
                    message: BrokerMessage::Bytes(vec![byte]),
                },
            )
            .await
            .unwrap();
        }
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(read_frame(&mut stream).await.unwrap().unwrap());
        }
        let delivered: Vec<&BrokerFrame> = frames
            .iter()
            .filter(|f| matches!(f, BrokerFrame::Deliver { .. }))
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(server.table().backlog_len("q"), 1);

        write_frame(
            &mut stream,
            &BrokerFrame::Settle {
                subscription,
                count: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_frame(&mut stream).await.unwrap().unwrap(),
            BrokerFrame::Deliver {
                subscription,
                message: BrokerMessage::Bytes(vec![2]),
            }
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let server = start().await;
        let mut stream = raw_client(&server).await;
        exchange(
            &mut stream,
            BrokerFrame::Hello {
                request: 1,
                client_name: "gw".to_string(),
            },
        )
        .await;
        exchange(
            &mut stream,
            BrokerFrame::Subscribe {
                request: 2,
                queue: "q".to_string(),
                window: 8,
            },
        )
        .await;
        assert_eq!(server.table().subscriber_count("q"), 1);

        write_frame(&mut stream, &BrokerFrame::Disconnect).await.unwrap();
        for _ in 0..100 {
            if server.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.table().subscriber_count("q"), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_silent_client_dropped() {
        let config = RelayServerConfig {
            client_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            ..RelayServerConfig::default()
        };
        let server = Arc::new(
            RelayServer::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
                .await
                .unwrap(),
        );
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });

        let mut stream = raw_client(&server).await;
        let end = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
            .await
            .unwrap();
        assert!(matches!(end, Ok(None) | Err(_)));
        server.shutdown();
    }
}
