//! Two-gateway test fixture
//!
//! Runs a real TCP relay on a loopback port and two gateways reaching it
//! over TCP: a provider-side gateway (`gatekeeper.cloudA`) and a
//! consumer-side gateway (`gatekeeper.cloudB`).
//!
//! # Example
//!
//! ```no_run
//! use relaygate_integration_tests::fixtures::TwoGatewayFixture;
//!
//! #[tokio::test]
//! async fn test_tunnel() {
//!     let fixture = TwoGatewayFixture::new().await.unwrap();
//!     let tunnel = fixture.open_tunnel().await.unwrap();
//!     // ... write to tunnel.client, read from tunnel.provider_socket ...
//!     fixture.cleanup().await;
//! }
//! ```

use rand_core::OsRng;
use relaygate_core::{
    CloudDescriptor, Gateway, GatewayConfig, Identity, RelayDescriptor, Result, ServiceDefinition,
    SessionEndpoints, SessionHandle, SystemDescriptor,
};
use relaygate_relay::RelayServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Relay plus a provider-side and a consumer-side gateway
pub struct TwoGatewayFixture {
    /// Relay both gateways talk to
    pub relay_server: Arc<RelayServer>,
    /// Descriptor of `relay_server`
    pub relay: RelayDescriptor,
    /// Gateway next to the real provider
    pub provider: Gateway,
    /// Gateway next to the consumer
    pub consumer: Gateway,
    server_task: JoinHandle<()>,
}

/// One established tunnel
pub struct Tunnel {
    /// Provider-side session
    pub provided: SessionHandle,
    /// Consumer-side session
    pub consumed: SessionHandle,
    /// Socket accepted by the stand-in provider
    pub provider_socket: TcpStream,
    /// Client connected to the consumer-side listener
    pub client: TcpStream,
}

impl TwoGatewayFixture {
    /// Fixture with default gateway configuration
    pub async fn new() -> Result<Self> {
        Self::with_config(GatewayConfig::default()).await
    }

    /// Fixture where both gateways use `config`
    pub async fn with_config(config: GatewayConfig) -> Result<Self> {
        let relay_server = Arc::new(RelayServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?);
        let relay = RelayDescriptor::new("127.0.0.1", relay_server.local_addr().port());

        let server = relay_server.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::warn!(error = %e, "Test relay stopped");
            }
        });

        let provider = Gateway::with_tcp(
            config.clone(),
            "gatekeeper.cloudA",
            Arc::new(Identity::generate(&mut OsRng)),
        )?;
        let consumer = Gateway::with_tcp(
            config,
            "gatekeeper.cloudB",
            Arc::new(Identity::generate(&mut OsRng)),
        )?;

        Ok(Self {
            relay_server,
            relay,
            provider,
            consumer,
            server_task,
        })
    }

    /// Session endpoints naming `provider` as the real provider
    pub fn endpoints(&self, provider: SocketAddr) -> SessionEndpoints {
        SessionEndpoints {
            consumer: SystemDescriptor::new("consumer", "127.0.0.1", 0),
            provider: SystemDescriptor::new("provider", provider.ip().to_string(), provider.port()),
            consumer_cloud: CloudDescriptor::new("operatorB", "cloudB"),
            provider_cloud: CloudDescriptor::new("operatorA", "cloudA"),
            service: ServiceDefinition::new("echo"),
        }
    }

    /// Open both sides of a session and connect a client to it.
    ///
    /// A loopback listener stands in for the real provider.
    pub async fn open_tunnel(&self) -> Result<Tunnel> {
        let provider_listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoints = self.endpoints(provider_listener.local_addr()?);

        let provided = self
            .provider
            .connect_provider(
                self.relay.clone(),
                endpoints.clone(),
                self.consumer.public_key(),
            )
            .await?;
        let (provider_socket, _) = provider_listener.accept().await?;

        let consumed = self
            .consumer
            .connect_consumer(
                self.relay.clone(),
                endpoints,
                self.provider.public_key(),
                provided.peer_name(),
                provided.queue_id(),
            )
            .await?;
        let port = consumed.local_port.unwrap_or_default();
        let client = TcpStream::connect(("127.0.0.1", port)).await?;

        Ok(Tunnel {
            provided,
            consumed,
            provider_socket,
            client,
        })
    }

    /// Shut both gateways and the relay down
    pub async fn cleanup(self) {
        self.consumer.shutdown().await;
        self.provider.shutdown().await;
        self.relay_server.shutdown();
        let _ = self.server_task.await;
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
