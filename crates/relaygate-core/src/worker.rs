//! Socket bridge workers.
//!
//! One worker per local session side. The worker owns the local TCP socket
//! and the relay handles and runs two loops:
//!
//! - relay → socket, in the worker task itself: data, control messages,
//!   commands and cancellation signals are multiplexed in one `select!`
//! - socket → relay, in a spawned reader task: every chunk read from the
//!   socket is sealed to the peer and published
//!
//! Whatever ends the session, teardown runs exactly once: the reader is
//! stopped, CLOSE is sent unless the peer initiated, queues are released and
//! the handle is deregistered.

use crate::config::SwitchFailurePolicy;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayShared;
use crate::handle::{WorkerCommand, WorkerHandle};
use crate::listener;
use crate::model::SessionSide;
use crate::session::SessionState;
use relaygate_crypto::PeerPublicKey;
use relaygate_relay::{
    BrokerMessage, Consumer, ConsumerSideRelayInfo, ControlMessage, ErrorKind, Producer,
    ProviderSideRelayInfo, RelayBinding, RelayDescriptor, RelayError, SessionId, SwitchRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producers a worker publishes through
#[derive(Debug)]
pub(crate) struct Outbound {
    data: Producer,
    control: Producer,
}

/// Consumers a worker reads from, with the binding they were opened on
#[derive(Debug)]
pub(crate) struct Inbound {
    binding: Arc<RelayBinding>,
    data: Consumer,
    control: Consumer,
}

/// Relay handles of one session side on one relay
#[derive(Debug)]
pub(crate) struct RelayHalves {
    outbound: Outbound,
    inbound: Inbound,
}

impl RelayHalves {
    pub(crate) fn provider(binding: Arc<RelayBinding>, info: ProviderSideRelayInfo) -> Self {
        Self {
            outbound: Outbound {
                data: info.message_sender,
                control: info.control_message_sender,
            },
            inbound: Inbound {
                binding,
                data: info.message_consumer,
                control: info.control_message_consumer,
            },
        }
    }

    pub(crate) fn consumer(binding: Arc<RelayBinding>, info: ConsumerSideRelayInfo) -> Self {
        Self {
            outbound: Outbound {
                data: info.message_sender,
                control: info.control_message_sender,
            },
            inbound: Inbound {
                binding,
                data: info.message_consumer,
                control: info.control_message_consumer,
            },
        }
    }

    /// Open the handles of `side` for an existing session on `binding`.
    pub(crate) async fn open(
        shared: &GatewayShared,
        side: SessionSide,
        binding: Arc<RelayBinding>,
        session: &SessionId,
    ) -> Result<Self> {
        Ok(match side {
            SessionSide::Provider => {
                let info = shared
                    .client
                    .open_provider_side_relay(&binding, session.clone())
                    .await?;
                Self::provider(binding, info)
            }
            SessionSide::Consumer => {
                let info = shared
                    .client
                    .initialize_consumer_side_relay(
                        &binding,
                        session.peer_name(),
                        session.queue_id(),
                    )
                    .await?;
                Self::consumer(binding, info)
            }
        })
    }

    /// Give the handles back when the session never started.
    pub(crate) async fn release(self, shared: &GatewayShared, session: &SessionId) {
        shared
            .client
            .unsubscribe_from_queues(&self.inbound.data, &self.inbound.control)
            .await;
        if shared
            .client
            .destroy_queues(&self.outbound.data, &self.outbound.control)
            .await
        {
            self.inbound.binding.untrack(session);
        }
    }
}

/// Where the local socket comes from
#[derive(Debug)]
pub(crate) enum LocalEndpoint {
    /// Provider side: already connected to the real provider
    Connected(TcpStream),
    /// Consumer side: waiting for the one local client
    Listening(TcpListener),
}

/// Why a session ended
#[derive(Debug)]
enum Ending {
    /// Local socket reached end of stream
    LocalEof,
    /// Peer sent CLOSE
    RemoteClose,
    /// Cooperative stop requested
    Interrupted,
    /// Immediate stop requested
    Closed,
    /// Relay queues vanished without a CLOSE
    RelayLost,
    /// Socket, relay or authentication failure
    Failed(GatewayError),
}

impl Ending {
    fn notifies_peer(&self) -> bool {
        !matches!(self, Ending::RemoteClose)
    }

    fn drains(&self) -> bool {
        matches!(
            self,
            Ending::LocalEof | Ending::Interrupted | Ending::RelayLost
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Ending::LocalEof => "local end of stream",
            Ending::RemoteClose => "peer CLOSE",
            Ending::Interrupted => "interrupt",
            Ending::Closed => "close",
            Ending::RelayLost => "relay queues lost",
            Ending::Failed(_) => "failure",
        }
    }
}

/// First pause before republishing to a full relay queue
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(20);

/// Longest pause between republish attempts
const MAX_QUEUE_FULL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum ReaderExit {
    Eof,
    Stopped,
    Failed(GatewayError),
}

/// Socket → relay loop, run as its own task.
struct SocketReader {
    shared: Arc<GatewayShared>,
    handle: Arc<WorkerHandle>,
    peer_key: PeerPublicKey,
    outbound: Arc<RwLock<Outbound>>,
    stop: CancellationToken,
}

impl SocketReader {
    async fn run(self, mut socket: OwnedReadHalf) -> ReaderExit {
        let mut buf = vec![0u8; self.shared.config.tunnel.buffer_size];
        loop {
            let n = tokio::select! {
                biased;
                () = self.stop.cancelled() => return ReaderExit::Stopped,
                read = socket.read(&mut buf) => match read {
                    Ok(0) => return ReaderExit::Eof,
                    Ok(n) => n,
                    Err(e) => return ReaderExit::Failed(e.into()),
                },
            };
            if !self.handle.state().is_open() {
                return ReaderExit::Stopped;
            }

            if let Some(exit) = self.publish(&buf[..n]).await {
                return exit;
            }

            self.handle.touch();
            self.shared.registry.stats().add_to_relay(n);
        }
    }
}

impl SocketReader {
    /// Publish one chunk, waiting out a full relay queue. The outbound lock
    /// is released between attempts so a relay switch is never held up.
    async fn publish(&self, chunk: &[u8]) -> Option<ReaderExit> {
        let mut backoff = QUEUE_FULL_BACKOFF;
        loop {
            let outbound = self.outbound.read().await;
            let sent = self
                .shared
                .client
                .send_bytes(&outbound.data, &self.peer_key, chunk)
                .await;
            drop(outbound);

            match sent {
                Ok(()) => return None,
                Err(e) if e.is_queue_full() => {
                    debug!(session = %self.handle.session(), ?backoff, "Relay queue full, backing off");
                    tokio::select! {
                        biased;
                        () = self.stop.cancelled() => return Some(ReaderExit::Stopped),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_QUEUE_FULL_BACKOFF);
                }
                Err(e) => return Some(ReaderExit::Failed(e.into())),
            }
        }
    }
}

/// The relay → socket half of a session, plus teardown.
pub(crate) struct Worker {
    shared: Arc<GatewayShared>,
    handle: Arc<WorkerHandle>,
    peer_key: PeerPublicKey,
    outbound: Arc<RwLock<Outbound>>,
    inbound: Inbound,
    /// Data consumer on the previous relay after this side initiated a switch
    draining: Option<Inbound>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    reader_stop: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<GatewayShared>,
        handle: Arc<WorkerHandle>,
        peer_key: PeerPublicKey,
        halves: RelayHalves,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        Self {
            shared,
            handle,
            peer_key,
            outbound: Arc::new(RwLock::new(halves.outbound)),
            inbound: halves.inbound,
            draining: None,
            commands,
            reader_stop: CancellationToken::new(),
        }
    }

    pub(crate) fn spawn(self, endpoint: LocalEndpoint) -> JoinHandle<()> {
        tokio::spawn(self.run(endpoint))
    }

    async fn run(mut self, endpoint: LocalEndpoint) {
        let stream = match self.establish(endpoint).await {
            Ok(stream) => stream,
            Err(ending) => {
                self.teardown(ending, None, None).await;
                return;
            }
        };

        let (read_half, mut writer) = stream.into_split();
        let reader = SocketReader {
            shared: self.shared.clone(),
            handle: self.handle.clone(),
            peer_key: self.peer_key,
            outbound: self.outbound.clone(),
            stop: self.reader_stop.clone(),
        };
        let mut reader = Some(tokio::spawn(reader.run(read_half)));

        let ending = self.relay_to_socket(&mut writer, &mut reader).await;
        self.teardown(ending, Some(writer), reader).await;
    }

    async fn establish(&mut self, endpoint: LocalEndpoint) -> std::result::Result<TcpStream, Ending> {
        let stream = match endpoint {
            LocalEndpoint::Connected(stream) => stream,
            LocalEndpoint::Listening(listener) => {
                let timeout = self.shared.config.tunnel.accept_timeout;
                tokio::select! {
                    biased;
                    () = self.handle.close_token().cancelled() => return Err(Ending::Closed),
                    () = self.handle.interrupt_token().cancelled() => return Err(Ending::Interrupted),
                    accepted = listener::accept_one(listener, timeout) => match accepted {
                        Ok((stream, client)) => {
                            debug!(session = %self.handle.session(), %client, "Local client connected");
                            stream
                        }
                        Err(e) => return Err(Ending::Failed(e)),
                    },
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session = %self.handle.session(), error = %e, "TCP_NODELAY not set");
        }
        self.handle
            .transition_to(SessionState::Open)
            .map_err(Ending::Failed)?;
        self.handle.touch();
        Ok(stream)
    }

    async fn relay_to_socket(
        &mut self,
        writer: &mut OwnedWriteHalf,
        reader: &mut Option<JoinHandle<ReaderExit>>,
    ) -> Ending {
        loop {
            tokio::select! {
                biased;
                () = self.handle.close_token().cancelled() => return Ending::Closed,
                message = recv_draining(&mut self.draining) => match message {
                    Some(message) => {
                        if let Err(e) = self.deliver(&message, writer).await {
                            return self.delivery_ending(e);
                        }
                    }
                    None => self.finish_draining().await,
                },
                message = self.inbound.data.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.deliver(&message, writer).await {
                            return self.delivery_ending(e);
                        }
                    }
                    None => return self.relay_lost(writer).await,
                },
                message = self.inbound.control.recv() => match message {
                    Some(message) => {
                        if let Some(ending) = self.on_control(&message, writer).await {
                            return ending;
                        }
                    }
                    None => return self.relay_lost(writer).await,
                },
                Some(command) = self.commands.recv() => self.on_command(command).await,
                () = self.handle.interrupt_token().cancelled() => return Ending::Interrupted,
                exit = join_reader(reader) => {
                    *reader = None;
                    return match exit {
                        ReaderExit::Eof => Ending::LocalEof,
                        ReaderExit::Stopped => Ending::Interrupted,
                        ReaderExit::Failed(e) => Ending::Failed(e),
                    };
                }
            }
        }
    }

    /// Open a relay message and write it to the socket.
    ///
    /// A local client that stops reading can park the write indefinitely, so
    /// the write gives up as soon as the session is closed.
    async fn deliver(&self, message: &BrokerMessage, writer: &mut OwnedWriteHalf) -> Result<()> {
        let bytes = self
            .shared
            .client
            .get_bytes_from_message(Some(message), &self.peer_key)
            .map_err(|e| self.relay_failure(e))?;
        tokio::select! {
            biased;
            () = self.handle.close_token().cancelled() => {
                return Err(GatewayError::io("session closed during socket write"));
            }
            written = writer.write_all(&bytes) => written?,
        }
        self.handle.touch();
        self.shared.registry.stats().add_from_relay(bytes.len());
        Ok(())
    }

    /// Ending for a failed delivery: a write cut short by close is a close.
    fn delivery_ending(&self, err: GatewayError) -> Ending {
        if self.handle.close_token().is_cancelled() {
            Ending::Closed
        } else {
            Ending::Failed(err)
        }
    }

    fn relay_failure(&self, err: RelayError) -> GatewayError {
        if err.kind() == ErrorKind::Security {
            self.shared.registry.stats().security_failure();
        }
        err.into()
    }

    /// Write out everything already received on the data queues.
    async fn drain_inbound(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        if let Some(old) = self.draining.as_mut() {
            let pending: Vec<BrokerMessage> = std::iter::from_fn(|| old.data.try_recv()).collect();
            for message in &pending {
                self.deliver(message, writer).await?;
            }
        }
        while let Some(message) = self.inbound.data.try_recv() {
            self.deliver(&message, writer).await?;
        }
        Ok(())
    }

    async fn relay_lost(&mut self, writer: &mut OwnedWriteHalf) -> Ending {
        // A peer closing sends CLOSE and then destroys its queues, so the
        // CLOSE may still be waiting behind the data queue's end.
        while let Some(message) = self.inbound.control.try_recv() {
            if let Some(ending) = self.on_control(&message, writer).await {
                return ending;
            }
        }
        Ending::RelayLost
    }

    async fn on_control(
        &mut self,
        message: &BrokerMessage,
        writer: &mut OwnedWriteHalf,
    ) -> Option<Ending> {
        let session = self.handle.session().clone();
        let control = match self
            .shared
            .client
            .open_control_message(Some(message), &self.peer_key)
        {
            Ok(control) => control,
            Err(e) => return Some(Ending::Failed(self.relay_failure(e))),
        };
        debug!(session = %session, message = control.name(), "Control message received");

        match control {
            ControlMessage::Close { .. } => match control.expect_close(&session) {
                Ok(()) => Some(match self.drain_inbound(writer).await {
                    Ok(()) => Ending::RemoteClose,
                    Err(e) => {
                        debug!(session = %session, error = %e, "Drain before CLOSE cut short");
                        Ending::RemoteClose
                    }
                }),
                Err(e) => Some(Ending::Failed(self.relay_failure(e))),
            },
            ControlMessage::Switch { .. } => {
                let outcome = match control.expect_switch(&session) {
                    Ok(request) => self.accept_switch(request, writer).await,
                    Err(e) => Err(self.relay_failure(e)),
                };
                match outcome {
                    Ok(()) => None,
                    Err(e @ GatewayError::Io(_)) => Some(self.delivery_ending(e)),
                    Err(e) => self.switch_failed(e),
                }
            }
        }
    }

    fn switch_failed(&self, err: GatewayError) -> Option<Ending> {
        let policy = self.shared.config.supervision.switch_failure_policy;
        warn!(
            session = %self.handle.session(),
            error = %err,
            ?policy,
            "Relay switch rejected"
        );
        self.handle.record_error(err.clone());
        match policy {
            SwitchFailurePolicy::Close => Some(Ending::Failed(err)),
            SwitchFailurePolicy::Keep => None,
        }
    }

    /// Receiving side of a relay switch.
    async fn accept_switch(
        &mut self,
        request: SwitchRequest,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let session = self.handle.session().clone();
        if request.relay == *self.inbound.binding.relay() {
            return Err(GatewayError::invalid_state("SWITCH names the relay already in use"));
        }
        let binding = self.shared.binding_for(&request.relay).await?;
        let halves =
            RelayHalves::open(&self.shared, self.handle.side(), binding.binding().clone(), &session)
                .await?;

        let mut outbound = self.outbound.write().await;
        let _previous = std::mem::replace(&mut *outbound, halves.outbound);
        drop(outbound);
        let mut old = std::mem::replace(&mut self.inbound, halves.inbound);
        self.handle.set_relay(request.relay.clone());

        let pending: Vec<BrokerMessage> = std::iter::from_fn(|| old.data.try_recv()).collect();
        for message in &pending {
            self.deliver(message, writer).await?;
        }
        self.shared
            .client
            .unsubscribe_from_queues(&old.data, &old.control)
            .await;
        if !old.binding.destroy_quadruple(&session).await {
            warn!(session = %session, relay = %old.binding.relay(), "Old relay queues not fully removed");
        }

        info!(
            session = %session,
            from = %old.binding.relay(),
            to = %request.relay,
            "Session moved to new relay"
        );
        Ok(())
    }

    async fn on_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Switch { relay, reply } => {
                let result = self.initiate_switch(relay).await;
                if let Err(e) = &result {
                    warn!(session = %self.handle.session(), error = %e, "Relay switch failed");
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Initiating side of a relay switch.
    async fn initiate_switch(&mut self, relay: RelayDescriptor) -> Result<()> {
        let session = self.handle.session().clone();
        if !self.handle.state().is_open() {
            return Err(GatewayError::invalid_state("session is not open"));
        }
        if self.draining.is_some() {
            return Err(GatewayError::invalid_state("a relay switch is still draining"));
        }
        if relay == *self.inbound.binding.relay() {
            return Err(GatewayError::invalid_state("session already uses this relay"));
        }

        let binding = self.shared.binding_for(&relay).await?;
        let halves =
            RelayHalves::open(&self.shared, self.handle.side(), binding.binding().clone(), &session)
                .await?;

        // Holding the write lock keeps the reader from publishing on the old
        // data queue after SWITCH went out.
        let mut outbound = self.outbound.write().await;
        if let Err(e) = self
            .shared
            .client
            .send_switch_control_message(&outbound.control, &self.peer_key, &session, &relay)
            .await
        {
            drop(outbound);
            self.shared
                .client
                .unsubscribe_from_queues(&halves.inbound.data, &halves.inbound.control)
                .await;
            binding.destroy_quadruple(&session).await;
            return Err(e.into());
        }
        let _previous = std::mem::replace(&mut *outbound, halves.outbound);
        drop(outbound);

        let old = std::mem::replace(&mut self.inbound, halves.inbound);
        old.control.unsubscribe().await;
        info!(
            session = %session,
            from = %old.binding.relay(),
            to = %relay,
            "Relay switch initiated"
        );
        self.draining = Some(old);
        self.handle.set_relay(relay);
        Ok(())
    }

    async fn finish_draining(&mut self) {
        if let Some(old) = self.draining.take() {
            old.data.unsubscribe().await;
            old.binding.untrack(self.handle.session());
            debug!(
                session = %self.handle.session(),
                relay = %old.binding.relay(),
                "Previous relay drained"
            );
        }
    }

    async fn teardown(
        mut self,
        ending: Ending,
        mut writer: Option<OwnedWriteHalf>,
        reader: Option<JoinHandle<ReaderExit>>,
    ) {
        if !self.handle.begin_teardown() {
            return;
        }
        let session = self.handle.session().clone();
        let side = self.handle.side();
        if let Err(e) = self.handle.transition_to(SessionState::Closing) {
            debug!(session = %session, error = %e, "Teardown from unexpected state");
        }
        self.reader_stop.cancel();

        if ending.drains() {
            if let Some(w) = writer.as_mut() {
                if let Err(e) = self.drain_inbound(w).await {
                    debug!(session = %session, error = %e, "Drain cut short");
                }
            }
        }
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        if ending.notifies_peer() {
            let outbound = self.outbound.read().await;
            if let Err(e) = self
                .shared
                .client
                .send_close_control_message(&outbound.control, &self.peer_key, &session)
                .await
            {
                debug!(session = %session, error = %e, "CLOSE not delivered");
            }
        }

        self.shared
            .client
            .unsubscribe_from_queues(&self.inbound.data, &self.inbound.control)
            .await;
        if let Some(old) = self.draining.take() {
            old.data.unsubscribe().await;
        }
        let destroyed = {
            let outbound = self.outbound.read().await;
            self.shared
                .client
                .destroy_queues(&outbound.data, &outbound.control)
                .await
        };
        if destroyed {
            self.inbound.binding.untrack(&session);
        }

        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }

        match &ending {
            Ending::Failed(e) => {
                error!(
                    session = %session,
                    side = %side,
                    peer = %self.peer_key.fingerprint(),
                    error = %e,
                    "Session terminated"
                );
                self.handle.record_error(e.clone());
            }
            other => info!(
                session = %session,
                side = %side,
                reason = other.name(),
                "Session closed"
            ),
        }

        if let Err(e) = self.handle.transition_to(SessionState::Closed) {
            debug!(session = %session, error = %e, "Closed transition refused");
        }
        self.shared.registry.deregister(side, &session);
        self.shared.registry.stats().session_closed();
        self.handle.mark_finished();
    }
}

async fn recv_draining(draining: &mut Option<Inbound>) -> Option<BrokerMessage> {
    match draining {
        Some(old) => old.data.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_reader(reader: &mut Option<JoinHandle<ReaderExit>>) -> ReaderExit {
    match reader {
        Some(task) => task.await.unwrap_or_else(|e| {
            ReaderExit::Failed(GatewayError::InvalidState(
                format!("socket reader task failed: {e}").into(),
            ))
        }),
        None => std::future::pending().await,
    }
}
