//! The gateway: composition root for sessions, bindings and supervision.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::handle::{WorkerCommand, WorkerHandle};
use crate::listener::PortAllocator;
use crate::model::{
    ActiveSessionRecord, CloudDescriptor, ServiceDefinition, SessionSide, SystemDescriptor, now_ms,
};
use crate::registry::{SessionRegistry, StatsSnapshot};
use crate::supervision::Supervisor;
use crate::worker::{LocalEndpoint, RelayHalves, Worker};
use relaygate_crypto::{Identity, PeerPublicKey};
use relaygate_relay::{
    BindingLease, BrokerConnector, GatewayRelayClient, RelayBinding, RelayDescriptor, RelayError,
    SessionId, TcpConnector,
};
use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Parties and service of a session, as agreed by orchestration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    /// Consuming system
    pub consumer: SystemDescriptor,
    /// Providing system; the provider side connects to its address
    pub provider: SystemDescriptor,
    /// Cloud of the consumer
    pub consumer_cloud: CloudDescriptor,
    /// Cloud of the provider
    pub provider_cloud: CloudDescriptor,
    /// Service carried
    pub service: ServiceDefinition,
}

/// Which side a [`ConnectRequest`] opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectSide {
    /// Mint a session and connect to the real provider
    Provider,
    /// Join the session the provider side minted
    Consumer {
        /// Peer name announced by the provider side
        peer_name: String,
        /// Queue id announced by the provider side
        queue_id: String,
    },
}

/// Session setup request
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Relay carrying the session
    pub relay: RelayDescriptor,
    /// Parties and service
    pub endpoints: SessionEndpoints,
    /// Public key of the gateway on the other side
    pub peer_key: PeerPublicKey,
    /// Side to open
    pub side: ConnectSide,
}

/// Result of a successful setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session identity; the provider side hands it to the consumer side
    pub session: SessionId,
    /// Local side
    pub side: SessionSide,
    /// Port local clients connect to, consumer side only
    pub local_port: Option<u16>,
}

impl SessionHandle {
    /// Peer name of the session
    #[must_use]
    pub fn peer_name(&self) -> &str {
        self.session.peer_name()
    }

    /// Queue id of the session
    #[must_use]
    pub fn queue_id(&self) -> &str {
        self.session.queue_id()
    }
}

/// State shared by the gateway and its workers
pub(crate) struct GatewayShared {
    pub(crate) config: GatewayConfig,
    pub(crate) local_name: String,
    pub(crate) client: GatewayRelayClient,
    pub(crate) connector: Arc<dyn BrokerConnector>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) ports: PortAllocator,
}

impl GatewayShared {
    /// Binding to `relay`, connecting on first use or when the cached one is
    /// closed. The returned lease keeps the stale sweep from closing the
    /// binding until the caller's queues are tracked on it.
    pub(crate) async fn binding_for(&self, relay: &RelayDescriptor) -> Result<BindingLease> {
        relay.validate()?;
        loop {
            if let Some(lease) = self.registry.binding(relay).and_then(|b| b.lease()) {
                return Ok(lease);
            }
            let binding =
                RelayBinding::connect(self.connector.as_ref(), relay, &self.local_name).await?;
            let lease = binding.lease().ok_or_else(|| {
                RelayError::transport(format!("relay binding to {relay} closed during setup"))
            })?;
            let kept = self.registry.insert_binding(binding.clone());
            if Arc::ptr_eq(&kept, &binding) {
                return Ok(lease);
            }
            drop(lease);
            binding.close().await;
        }
    }
}

/// Relay-mediated tunnel gateway.
///
/// Owns the session registry, the relay bindings and the supervision
/// tasks. Both sides of a session may be served by the same gateway.
pub struct Gateway {
    shared: Arc<GatewayShared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Gateway {
    /// Create a gateway presenting `local_name` to relays.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] for an invalid configuration
    /// or an empty name.
    pub fn new(
        config: GatewayConfig,
        local_name: impl Into<String>,
        identity: Arc<Identity>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let local_name = local_name.into();
        if local_name.is_empty() {
            return Err(GatewayError::invalid_config("local name must not be empty"));
        }
        Ok(Self {
            shared: Arc::new(GatewayShared {
                ports: PortAllocator::new(config.tunnel.port_range),
                config,
                local_name,
                client: GatewayRelayClient::new(identity),
                connector,
                registry: Arc::new(SessionRegistry::new()),
            }),
            supervisor: Mutex::new(None),
        })
    }

    /// Create a gateway reaching relays over TCP.
    ///
    /// # Errors
    ///
    /// As [`Gateway::new`].
    pub fn with_tcp(
        config: GatewayConfig,
        local_name: impl Into<String>,
        identity: Arc<Identity>,
    ) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(config.relay.broker_config()));
        Self::new(config, local_name, identity, connector)
    }

    /// Name presented to relays; provider-side sessions use it as peer name
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.shared.local_name
    }

    /// Key peers seal to
    #[must_use]
    pub fn public_key(&self) -> PeerPublicKey {
        self.shared.client.public_key()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    /// Handle of one side of a session
    #[must_use]
    pub fn worker(&self, side: SessionSide, session: &SessionId) -> Option<Arc<WorkerHandle>> {
        self.shared.registry.get(side, session)
    }

    /// Open one side of a session.
    ///
    /// # Errors
    ///
    /// - argument errors for a bad relay descriptor, empty names or a side
    ///   that is already open here
    /// - transport errors if the relay, the provider or a local port is
    ///   unavailable
    pub async fn connect(&self, request: ConnectRequest) -> Result<SessionHandle> {
        let ConnectRequest {
            relay,
            endpoints,
            peer_key,
            side,
        } = request;
        relay.validate()?;

        match side {
            ConnectSide::Provider => {
                let stream = self.connect_to_provider(&endpoints.provider).await?;
                let binding = self.shared.binding_for(&relay).await?;
                let info = self
                    .shared
                    .client
                    .initialize_provider_side_relay(&binding)
                    .await?;
                let session = info.session.clone();
                let halves = RelayHalves::provider(binding.binding().clone(), info);
                self.launch(
                    session,
                    SessionSide::Provider,
                    relay,
                    endpoints,
                    peer_key,
                    halves,
                    LocalEndpoint::Connected(stream),
                    None,
                )
                .await
            }
            ConnectSide::Consumer { peer_name, queue_id } => {
                let session = SessionId::new(peer_name, queue_id)?;
                if self
                    .shared
                    .registry
                    .get(SessionSide::Consumer, &session)
                    .is_some()
                {
                    return Err(GatewayError::InvalidState(Cow::Owned(format!(
                        "consumer side of {session} is already open"
                    ))));
                }
                let binding = self.shared.binding_for(&relay).await?;
                let info = self
                    .shared
                    .client
                    .initialize_consumer_side_relay(
                        &binding,
                        session.peer_name(),
                        session.queue_id(),
                    )
                    .await?;
                let halves = RelayHalves::consumer(binding.binding().clone(), info);

                let bound = match self.shared.ports.bind(&self.shared.config.tunnel).await {
                    Ok(listener) => listener.local_addr().map(|addr| (listener, addr.port())),
                    Err(e) => {
                        halves.release(&self.shared, &session).await;
                        return Err(e);
                    }
                };
                let (listener, port) = match bound {
                    Ok(bound) => bound,
                    Err(e) => {
                        halves.release(&self.shared, &session).await;
                        return Err(e.into());
                    }
                };
                self.launch(
                    session,
                    SessionSide::Consumer,
                    relay,
                    endpoints,
                    peer_key,
                    halves,
                    LocalEndpoint::Listening(listener),
                    Some(port),
                )
                .await
            }
        }
    }

    /// Open the provider side: mint a session on `relay` and connect to
    /// `endpoints.provider`.
    ///
    /// # Errors
    ///
    /// As [`Gateway::connect`].
    pub async fn connect_provider(
        &self,
        relay: RelayDescriptor,
        endpoints: SessionEndpoints,
        peer_key: PeerPublicKey,
    ) -> Result<SessionHandle> {
        self.connect(ConnectRequest {
            relay,
            endpoints,
            peer_key,
            side: ConnectSide::Provider,
        })
        .await
    }

    /// Open the consumer side of `(peer_name, queue_id)` and listen locally.
    ///
    /// # Errors
    ///
    /// As [`Gateway::connect`].
    pub async fn connect_consumer(
        &self,
        relay: RelayDescriptor,
        endpoints: SessionEndpoints,
        peer_key: PeerPublicKey,
        peer_name: impl Into<String>,
        queue_id: impl Into<String>,
    ) -> Result<SessionHandle> {
        self.connect(ConnectRequest {
            relay,
            endpoints,
            peer_key,
            side: ConnectSide::Consumer {
                peer_name: peer_name.into(),
                queue_id: queue_id.into(),
            },
        })
        .await
    }

    async fn connect_to_provider(&self, provider: &SystemDescriptor) -> Result<TcpStream> {
        let addr = provider.socket_addr();
        let timeout = self.shared.config.tunnel.provider_connect_timeout;
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RelayError::transport(format!(
                "cannot reach provider {provider}: {e}"
            ))
            .into()),
            Err(_) => Err(RelayError::transport(format!(
                "provider {provider} did not answer within {timeout:?}"
            ))
            .into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        session: SessionId,
        side: SessionSide,
        relay: RelayDescriptor,
        endpoints: SessionEndpoints,
        peer_key: PeerPublicKey,
        halves: RelayHalves,
        endpoint: LocalEndpoint,
        local_port: Option<u16>,
    ) -> Result<SessionHandle> {
        let record = ActiveSessionRecord {
            queues: session.queues(),
            session: session.clone(),
            side,
            consumer: endpoints.consumer,
            provider: endpoints.provider,
            consumer_cloud: endpoints.consumer_cloud,
            provider_cloud: endpoints.provider_cloud,
            service: endpoints.service,
            relay: relay.clone(),
            started_at_ms: now_ms(),
            local_port,
        };
        let (handle, commands) = WorkerHandle::new(record);
        let handle = Arc::new(handle);
        if let Err(e) = self.shared.registry.register(handle.clone()) {
            halves.release(&self.shared, &session).await;
            return Err(e);
        }

        info!(
            session = %session,
            side = %side,
            relay = %relay,
            peer = %peer_key.fingerprint(),
            port = ?local_port,
            "Session established"
        );
        Worker::new(self.shared.clone(), handle, peer_key, halves, commands).spawn(endpoint);

        Ok(SessionHandle {
            session,
            side,
            local_port,
        })
    }

    /// Records of all local sessions, oldest first
    #[must_use]
    pub fn list_sessions(&self) -> Vec<ActiveSessionRecord> {
        self.shared.registry.records()
    }

    /// Close local sessions, waiting for each to finish.
    ///
    /// Every local side of each id is asked to drain and stop; one that does
    /// not finish within the request timeout is stopped immediately.
    pub async fn close_sessions(&self, sessions: &[SessionId]) -> Vec<(SessionId, Result<()>)> {
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            let handles = self.shared.registry.find(session);
            let result = if handles.is_empty() {
                Err(GatewayError::SessionNotFound(session.clone()))
            } else {
                self.stop_all(&handles).await
            };
            results.push((session.clone(), result));
        }
        results
    }

    async fn stop_all(&self, handles: &[Arc<WorkerHandle>]) -> Result<()> {
        let patience = self.shared.config.relay.request_timeout;
        for handle in handles {
            handle.interrupt();
        }
        for handle in handles {
            if tokio::time::timeout(patience, handle.finished()).await.is_err() {
                warn!(session = %handle.session(), "Session did not drain in time, closing");
                handle.close();
                if tokio::time::timeout(patience, handle.finished()).await.is_err() {
                    return Err(GatewayError::InvalidState(Cow::Owned(format!(
                        "session {} did not stop",
                        handle.session()
                    ))));
                }
            }
        }
        Ok(())
    }

    /// Send CLOSE on both control queues of a session this gateway does not
    /// hold, sealed to `peer_key`.
    ///
    /// Only the side whose peer is this gateway's identity accepts it.
    ///
    /// # Errors
    ///
    /// Argument errors for bad names or relay, transport errors if the relay
    /// is unreachable.
    pub async fn close_via_control_relay(
        &self,
        relay: &RelayDescriptor,
        session: &SessionId,
        peer_key: &PeerPublicKey,
    ) -> Result<()> {
        let binding = self.shared.binding_for(relay).await?;
        let control = self
            .shared
            .client
            .initialize_control_relay(&binding, session.peer_name(), session.queue_id())
            .await?;
        for sender in [&control.control_request_sender, &control.control_response_sender] {
            self.shared
                .client
                .send_close_control_message(sender, peer_key, session)
                .await?;
        }
        info!(session = %session, relay = %relay, "CLOSE sent through control queues");
        Ok(())
    }

    /// Move a local session to `relay`, this side initiating.
    ///
    /// If both sides are local, the consumer side initiates.
    ///
    /// # Errors
    ///
    /// [`GatewayError::SessionNotFound`] for an unknown session,
    /// [`GatewayError::InvalidState`] if it is not open or already switching,
    /// relay errors if the new relay cannot be used.
    pub async fn switch_relay(&self, session: &SessionId, relay: RelayDescriptor) -> Result<()> {
        relay.validate()?;
        let handle = self
            .shared
            .registry
            .find(session)
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::SessionNotFound(session.clone()))?;

        let (reply, response) = oneshot::channel();
        handle.send_command(WorkerCommand::Switch { relay, reply })?;
        response
            .await
            .map_err(|_| GatewayError::invalid_state("session ended during relay switch"))?
    }

    /// Start the supervision tasks. Does nothing if they already run.
    pub fn start_supervision(&self) {
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Supervisor::spawn(
                self.shared.registry.clone(),
                self.shared.config.supervision.clone(),
            ));
        }
    }

    /// Returns true while supervision runs
    #[must_use]
    pub fn is_supervising(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Gateway counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.registry.stats_snapshot()
    }

    /// Stop supervision, close every session and every binding.
    pub async fn shutdown(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }

        let handles: Vec<Arc<WorkerHandle>> = [SessionSide::Consumer, SessionSide::Provider]
            .into_iter()
            .flat_map(|side| self.shared.registry.handles(side))
            .collect();
        if let Err(e) = self.stop_all(&handles).await {
            warn!(error = %e, "Sessions left running at shutdown");
        }

        for binding in self.shared.registry.bindings() {
            binding.close().await;
            self.shared.registry.remove_binding(&binding);
        }
        debug!(name = %self.shared.local_name, "Gateway shut down");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("local_name", &self.shared.local_name)
            .field("sessions", &self.shared.registry.len())
            .finish()
    }
}
