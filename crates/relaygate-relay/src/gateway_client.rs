//! Session queue setup, sealed send/receive, and control messages.
//!
//! [`GatewayRelayClient`] holds the local identity and operates on a
//! [`RelayBinding`]. Queue roles per side:
//!
//! | side     | producers                         | consumers                           |
//! |----------|-----------------------------------|-------------------------------------|
//! | provider | `REQ-…`, `REQ-…-CONTROL`          | `RESP-…`, `RESP-…-CONTROL`          |
//! | consumer | `RESP-…`, `RESP-…-CONTROL`        | `REQ-…`, `REQ-…-CONTROL`            |
//!
//! Nothing here retries. Forged or malformed messages surface as
//! [`RelayError::Security`], never silently dropped.

use crate::binding::RelayBinding;
use crate::broker::{Consumer, Producer};
use crate::control::{ControlMessage, SwitchRequest};
use crate::descriptor::RelayDescriptor;
use crate::error::{ErrorKind, RelayError, Result};
use crate::message::BrokerMessage;
use crate::naming::SessionId;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use relaygate_crypto::{Identity, PeerPublicKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles of the provider side of a freshly minted session.
#[derive(Debug)]
pub struct ProviderSideRelayInfo {
    /// Minted session identity
    pub session: SessionId,
    /// Producer on the request queue
    pub message_sender: Producer,
    /// Producer on the request control queue
    pub control_message_sender: Producer,
    /// Consumer on the response queue
    pub message_consumer: Consumer,
    /// Consumer on the response control queue
    pub control_message_consumer: Consumer,
}

impl ProviderSideRelayInfo {
    /// Name the consumer side must use to find these queues
    #[must_use]
    pub fn peer_name(&self) -> &str {
        self.session.peer_name()
    }

    /// Minted queue id
    #[must_use]
    pub fn queue_id(&self) -> &str {
        self.session.queue_id()
    }
}

/// Handles of the consumer side of a session.
#[derive(Debug)]
pub struct ConsumerSideRelayInfo {
    /// Session identity
    pub session: SessionId,
    /// Producer on the response queue
    pub message_sender: Producer,
    /// Producer on the response control queue
    pub control_message_sender: Producer,
    /// Consumer on the request queue
    pub message_consumer: Consumer,
    /// Consumer on the request control queue
    pub control_message_consumer: Consumer,
}

/// Producers on both control queues of a session, for administrative use.
#[derive(Debug)]
pub struct ControlRelayInfo {
    /// Producer on the request control queue
    pub control_request_sender: Producer,
    /// Producer on the response control queue
    pub control_response_sender: Producer,
}

/// Relay-side operations of one gateway.
#[derive(Clone)]
pub struct GatewayRelayClient {
    identity: Arc<Identity>,
}

impl GatewayRelayClient {
    /// Create a client acting as `identity`.
    #[must_use]
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    /// Public key peers seal to and verify against
    #[must_use]
    pub fn public_key(&self) -> PeerPublicKey {
        self.identity.public_key()
    }

    /// Mint a session and open the provider side of its quadruple.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the binding's broker session is
    /// closed or a queue cannot be opened.
    pub async fn initialize_provider_side_relay(
        &self,
        binding: &RelayBinding,
    ) -> Result<ProviderSideRelayInfo> {
        let session = SessionId::mint(binding.local_name())?;
        self.open_provider_side_relay(binding, session).await
    }

    /// Open the provider side of the quadruple of an existing `session`,
    /// used when a session moves to another relay.
    ///
    /// # Errors
    ///
    /// As [`GatewayRelayClient::initialize_provider_side_relay`].
    pub async fn open_provider_side_relay(
        &self,
        binding: &RelayBinding,
        session: SessionId,
    ) -> Result<ProviderSideRelayInfo> {
        let broker = binding.broker()?;
        let queues = session.queues();

        let message_sender = Producer::open(broker.clone(), &queues.request).await?;
        let control_message_sender = Producer::open(broker.clone(), &queues.request_control).await?;
        let message_consumer = Consumer::open(broker.clone(), &queues.response).await?;
        let control_message_consumer = match Consumer::open(broker, &queues.response_control).await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                message_consumer.unsubscribe().await;
                return Err(e);
            }
        };

        binding.track(&session);
        debug!(session = %session, relay = %binding.relay(), "Provider side queues opened");
        Ok(ProviderSideRelayInfo {
            session,
            message_sender,
            control_message_sender,
            message_consumer,
            control_message_consumer,
        })
    }

    /// Open the consumer side of the quadruple of `(peer_name, queue_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Argument`] without touching the broker if
    /// either name part is empty, [`RelayError::Transport`] if the binding's
    /// broker session is closed, and [`RelayError::Argument`] if any of the
    /// four handles cannot be created. Handles created before the failure
    /// are released.
    pub async fn initialize_consumer_side_relay(
        &self,
        binding: &RelayBinding,
        peer_name: &str,
        queue_id: &str,
    ) -> Result<ConsumerSideRelayInfo> {
        let session = SessionId::new(peer_name, queue_id)?;
        let broker = binding.broker()?;
        let queues = session.queues();
        let setup_failed =
            |e: RelayError| RelayError::argument(format!("cannot open queues of {session}: {e}"));

        let message_sender = Producer::open(broker.clone(), &queues.response)
            .await
            .map_err(setup_failed)?;
        let control_message_sender = Producer::open(broker.clone(), &queues.response_control)
            .await
            .map_err(setup_failed)?;
        let message_consumer = Consumer::open(broker.clone(), &queues.request)
            .await
            .map_err(setup_failed)?;
        let control_message_consumer = match Consumer::open(broker, &queues.request_control).await {
            Ok(consumer) => consumer,
            Err(e) => {
                message_consumer.unsubscribe().await;
                return Err(setup_failed(e));
            }
        };

        binding.track(&session);
        debug!(session = %session, relay = %binding.relay(), "Consumer side queues opened");
        Ok(ConsumerSideRelayInfo {
            session,
            message_sender,
            control_message_sender,
            message_consumer,
            control_message_consumer,
        })
    }

    /// Open producers on both control queues of `(peer_name, queue_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Argument`] on empty names, and
    /// [`RelayError::Transport`] on a closed binding or if a producer cannot
    /// be opened.
    pub async fn initialize_control_relay(
        &self,
        binding: &RelayBinding,
        peer_name: &str,
        queue_id: &str,
    ) -> Result<ControlRelayInfo> {
        let session = SessionId::new(peer_name, queue_id)?;
        let broker = binding.broker()?;
        let queues = session.queues();

        Ok(ControlRelayInfo {
            control_request_sender: Producer::open(broker.clone(), &queues.request_control).await?,
            control_response_sender: Producer::open(broker, &queues.response_control).await?,
        })
    }

    /// Seal `bytes` to `peer_key` and publish them through `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the connection is not open or
    /// the publish fails.
    pub async fn send_bytes(
        &self,
        sender: &Producer,
        peer_key: &PeerPublicKey,
        bytes: &[u8],
    ) -> Result<()> {
        if !sender.is_open() {
            return Err(RelayError::transport(format!(
                "broker connection closed, cannot send to {}",
                sender.queue()
            )));
        }
        let envelope = relaygate_crypto::seal(&self.identity, peer_key, bytes)?;
        sender.send(BrokerMessage::Bytes(envelope)).await
    }

    /// Authenticate and decrypt a received message.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Argument`] if `message` is `None`
    /// - [`RelayError::Transport`] if it carries no payload
    /// - [`RelayError::Security`] if it does not open under the local key
    ///   from `peer_key`
    pub fn get_bytes_from_message(
        &self,
        message: Option<&BrokerMessage>,
        peer_key: &PeerPublicKey,
    ) -> Result<Vec<u8>> {
        let message = message.ok_or_else(|| RelayError::argument("message is missing"))?;
        let envelope = match message {
            BrokerMessage::Bytes(bytes) => std::borrow::Cow::Borrowed(bytes.as_slice()),
            BrokerMessage::Text(text) => std::borrow::Cow::Owned(
                BASE64
                    .decode(text.trim())
                    .map_err(|e| RelayError::security(format!("undecodable text message: {e}")))?,
            ),
            BrokerMessage::Advisory { topic, .. } => {
                return Err(RelayError::transport(format!(
                    "broker advisory {topic} carries no payload"
                )));
            }
        };
        Ok(relaygate_crypto::open(&self.identity, peer_key, &envelope)?)
    }

    /// Drop both subscriptions. Never fails.
    pub async fn unsubscribe_from_queues(&self, consumer: &Consumer, control_consumer: &Consumer) {
        consumer.unsubscribe().await;
        control_consumer.unsubscribe().await;
    }

    /// Remove both queues. Returns true only if both were removed.
    pub async fn destroy_queues(&self, producer: &Producer, control_producer: &Producer) -> bool {
        let mut destroyed = true;
        for sender in [producer, control_producer] {
            if let Err(e) = sender.destroy().await {
                warn!(queue = sender.queue(), error = %e, "Queue not destroyed");
                destroyed = false;
            }
        }
        destroyed
    }

    /// Send CLOSE for `session` through `control_sender`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the message cannot be published.
    pub async fn send_close_control_message(
        &self,
        control_sender: &Producer,
        peer_key: &PeerPublicKey,
        session: &SessionId,
    ) -> Result<()> {
        let body = ControlMessage::close(session).to_bytes()?;
        self.send_bytes(control_sender, peer_key, &body).await
    }

    /// Send SWITCH for `session` to `relay` through `control_sender`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the message cannot be published.
    pub async fn send_switch_control_message(
        &self,
        control_sender: &Producer,
        peer_key: &PeerPublicKey,
        session: &SessionId,
        relay: &RelayDescriptor,
    ) -> Result<()> {
        let body = ControlMessage::switch(session, relay.clone()).to_bytes()?;
        self.send_bytes(control_sender, peer_key, &body).await
    }

    /// Open a control-queue message and decode its body.
    ///
    /// # Errors
    ///
    /// Errors of [`GatewayRelayClient::get_bytes_from_message`], or
    /// [`RelayError::Protocol`] if the body is not a control message.
    pub fn open_control_message(
        &self,
        message: Option<&BrokerMessage>,
        peer_key: &PeerPublicKey,
    ) -> Result<ControlMessage> {
        let body = self.get_bytes_from_message(message, peer_key)?;
        ControlMessage::from_bytes(&body)
    }

    /// Check that `message` is an authentic CLOSE for `session`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Security`] if the message fails authentication or names
    /// another queue id, [`RelayError::Protocol`] for a data payload or a
    /// SWITCH.
    pub fn handle_close_control_message(
        &self,
        message: Option<&BrokerMessage>,
        session: &SessionId,
        peer_key: &PeerPublicKey,
    ) -> Result<()> {
        self.open_control_message(message, peer_key)?
            .expect_close(session)
    }

    /// Check that `message` is an authentic, well-formed SWITCH for `session`.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`RelayError::Security`].
    pub fn validate_switch_control_message(
        &self,
        message: Option<&BrokerMessage>,
        session: &SessionId,
        peer_key: &PeerPublicKey,
    ) -> Result<SwitchRequest> {
        let control = self
            .open_control_message(message, peer_key)
            .map_err(|e| {
                if e.kind() == ErrorKind::Security {
                    e
                } else {
                    RelayError::security(format!("invalid SWITCH: {e}"))
                }
            })?;
        control.expect_switch(session)
    }
}

impl std::fmt::Debug for GatewayRelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRelayClient")
            .field("public_key", &self.identity.public_key().fingerprint())
            .finish()
    }
}
