//! Connection handshake, routing loop and public entry point.
//!
//! # Handshake
//!
//! ```text
//!   A                              B
//!   |-- ready (probe) ------------>|   both sides announce on creation
//!   |<------------- ready (probe) -|
//!   |-- ready ------------------->|   first ready seen: reply, then init
//!   |-- init (boxed value) ------->|
//!   |<------------------- init ---|   peer's init: revive, Ready
//! ```
//!
//! Each side derives capabilities from the first `ready` it receives and
//! ignores later ones. After the handshake the loop routes `message` and
//! `port-closed` envelopes to sub-channels until the transport ends or the
//! connection is closed.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::protocol::{ChannelId, EnvCheck, Envelope, Message};
use crate::capabilities::PlatformCapabilities;
use crate::channel::ChannelError;
use crate::link::Link;
use crate::revivable::{BoxError, ReviveError, box_packet, revive_packet};
use crate::transport::{
    Emitter, Incoming, IncomingStream, Packet, Transferable, Transport, TransportError,
};
use crate::value::Value;

pub const DEFAULT_KEY: &str = "tether";

/// Options for [`expose`].
#[derive(Debug, Clone)]
pub struct ExposeConfig {
    /// Namespace; connections sharing a transport only see matching keys.
    pub key: String,
    /// Upper bound on what the probe may enable.
    pub capabilities: PlatformCapabilities,
}

impl Default for ExposeConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_string(),
            capabilities: PlatformCapabilities::NATIVE,
        }
    }
}

impl ExposeConfig {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Route everything by id even if the transport could carry handles.
    pub fn json_only(self) -> Self {
        self.with_capabilities(PlatformCapabilities::JSON_ONLY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("message for unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("channel {0} belongs to neither endpoint")]
    ForgedChannel(ChannelId),
    #[error(transparent)]
    Channel(ChannelError),
    #[error("failed to box exposed value: {0}")]
    Box(#[from] BoxError),
    #[error("failed to revive remote value: {0}")]
    Revive(#[from] ReviveError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<ChannelError> for ConnectionError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Unknown(id) => Self::UnknownChannel(id),
            ChannelError::Forged(id) => Self::ForgedChannel(id),
            other => Self::Channel(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Announcing,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    /// Closed locally or the transport ended.
    Closed,
    /// Torn down by a protocol or transport failure.
    Failed(ConnectionError),
}

type InitResult = Result<(Value, Arc<Link>), ConnectionError>;

/// Handshake and routing state for one endpoint.
pub(crate) struct ConnectionState {
    key: String,
    local: Uuid,
    ceiling: PlatformCapabilities,
    emitter: Arc<dyn Emitter>,
    state: HandshakeState,
    received_ready: bool,
    exposed: Option<Value>,
    link: Option<Arc<Link>>,
    init_tx: Option<oneshot::Sender<InitResult>>,
}

impl ConnectionState {
    pub(crate) fn new(
        value: Value,
        emitter: Arc<dyn Emitter>,
        config: ExposeConfig,
        init_tx: oneshot::Sender<InitResult>,
    ) -> Self {
        Self {
            key: config.key,
            local: Uuid::new_v4(),
            ceiling: config.capabilities,
            emitter,
            state: HandshakeState::Announcing,
            received_ready: false,
            exposed: Some(value),
            link: None,
            init_tx: Some(init_tx),
        }
    }

    pub(crate) fn local(&self) -> Uuid {
        self.local
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send our `ready` with a probe payload.
    pub(crate) fn announce(&self) -> Result<(), TransportError> {
        let (env_check, transfer) = PlatformCapabilities::probe_payload(self.emitter.is_json());
        self.emitter.emit(
            Envelope::new(self.key.clone(), self.local, Message::Ready { env_check }),
            transfer,
        )
    }

    pub(crate) fn handle(&mut self, incoming: Incoming) -> Result<(), ConnectionError> {
        let Incoming { envelope, transfer } = incoming;
        if envelope.key != self.key {
            tracing::trace!(key = %envelope.key, "Ignoring envelope for another namespace");
            return Ok(());
        }
        if envelope.uuid == self.local {
            // Own traffic echoed back by a shared transport.
            return Ok(());
        }
        if let Some(link) = &self.link
            && envelope.uuid != link.remote()
        {
            tracing::warn!(
                local = %self.local,
                sender = %envelope.uuid,
                "Ignoring envelope from a third party"
            );
            return Ok(());
        }

        tracing::trace!(
            local = %self.local,
            message = envelope.message.name(),
            "Handling envelope"
        );
        match envelope.message {
            Message::Ready { env_check } => self.on_ready(envelope.uuid, &env_check, transfer),
            Message::Init { data } => self.on_init(Packet::new(data, transfer)),
            Message::Data { port_id, data } => {
                let link = self.require_link("message")?;
                Ok(link.route(port_id, Packet::new(data, transfer))?)
            }
            Message::PortClosed { port_id } => {
                let link = self.require_link("port-closed")?;
                Ok(link.remote_closed(port_id)?)
            }
        }
    }

    fn require_link(&self, what: &str) -> Result<&Arc<Link>, ConnectionError> {
        self.link
            .as_ref()
            .ok_or_else(|| ConnectionError::protocol(format!("{what} received before ready")))
    }

    fn on_ready(
        &mut self,
        remote: Uuid,
        env_check: &EnvCheck,
        transfer: Vec<Transferable>,
    ) -> Result<(), ConnectionError> {
        if self.received_ready {
            tracing::debug!(local = %self.local, %remote, "Ignoring duplicate ready");
            return Ok(());
        }
        self.received_ready = true;

        let observed = if self.emitter.is_json() {
            PlatformCapabilities::JSON_ONLY
        } else {
            PlatformCapabilities::observe(env_check, &transfer)
        };
        let capabilities = observed.intersect(self.ceiling);
        tracing::debug!(
            key = %self.key,
            local = %self.local,
            %remote,
            ?capabilities,
            "Peer announced"
        );

        let link = Link::new(
            self.key.clone(),
            self.local,
            remote,
            capabilities,
            Arc::clone(&self.emitter),
        );
        self.link = Some(Arc::clone(&link));

        // The peer may have announced before we were listening.
        self.announce()?;

        let value = self.exposed.take().unwrap_or(Value::Null);
        let Packet { data, transfer } = box_packet(&link, value)?;
        link.emit(Message::Init { data }, transfer)?;
        Ok(())
    }

    fn on_init(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let link = Arc::clone(self.require_link("init")?);
        if self.state == HandshakeState::Ready {
            return Err(ConnectionError::protocol("duplicate init"));
        }

        let value = revive_packet(&link, packet)?;
        self.state = HandshakeState::Ready;
        tracing::debug!(local = %self.local, remote = %link.remote(), "Connection ready");

        if let Some(init_tx) = self.init_tx.take()
            && init_tx.send(Ok((value, link))).is_err()
        {
            tracing::debug!(local = %self.local, "Remote value arrived after expose() was dropped");
        }
        Ok(())
    }

    /// Release everything; returns the final status.
    pub(crate) fn teardown(&mut self, outcome: Result<(), ConnectionError>) -> ConnectionStatus {
        self.state = HandshakeState::Closed;
        let status = match outcome {
            Ok(()) => ConnectionStatus::Closed,
            Err(e) => ConnectionStatus::Failed(e),
        };

        if let Some(init_tx) = self.init_tx.take() {
            let error = match &status {
                ConnectionStatus::Failed(e) => e.clone(),
                _ => ConnectionError::Closed,
            };
            let _ = init_tx.send(Err(error));
        }
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        tracing::debug!(local = %self.local, ?status, "Connection closed");
        status
    }
}

/// Routing loop: runs until shutdown, transport end, or a fatal error.
async fn drive(
    mut state: ConnectionState,
    mut incoming: IncomingStream,
    shutdown: CancellationToken,
    status: watch::Sender<ConnectionStatus>,
) {
    let outcome = loop {
        let next = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!(local = %state.local(), "Connection closed locally");
                break Ok(());
            }
            next = incoming.next() => next,
        };

        match next {
            Some(Ok(incoming)) => {
                if let Err(e) = state.handle(incoming) {
                    tracing::error!(local = %state.local(), error = %e, "Fatal protocol error");
                    break Err(e);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(local = %state.local(), error = %e, "Transport failed");
                break Err(e.into());
            }
            None if state.state() == HandshakeState::Announcing => {
                tracing::warn!(local = %state.local(), "Transport ended during handshake");
                break Ok(());
            }
            None => {
                tracing::debug!(local = %state.local(), "Transport ended");
                break Ok(());
            }
        }
    };

    status.send_replace(state.teardown(outcome));
}

/// Result of a successful [`expose`].
pub struct Exposed {
    /// The value the peer exposed.
    pub remote: Value,
    pub connection: Connection,
}

/// Handle on a live connection.
///
/// Dropping the handle doesn't close the connection; revived values keep
/// using it until [`close`](Self::close) or the transport ends.
#[derive(Clone)]
pub struct Connection {
    link: Arc<Link>,
    shutdown: CancellationToken,
    status: watch::Receiver<ConnectionStatus>,
}

impl Connection {
    pub fn local_id(&self) -> Uuid {
        self.link.local()
    }

    pub fn remote_id(&self) -> Uuid {
        self.link.remote()
    }

    /// Capabilities this side boxes with.
    pub fn capabilities(&self) -> PlatformCapabilities {
        self.link.capabilities()
    }

    /// Entries in the sub-channel table, including ones still closing.
    pub fn live_channels(&self) -> usize {
        self.link.live_channels()
    }

    /// Local channel ends not yet released.
    pub fn outstanding_handles(&self) -> usize {
        self.link.outstanding_handles()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the connection is no longer open.
    pub async fn closed(&self) -> ConnectionStatus {
        let mut status = self.status.clone();
        match status
            .wait_for(|status| *status != ConnectionStatus::Open)
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => ConnectionStatus::Closed,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local_id())
            .field("remote", &self.remote_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Expose `value` to the peer on the other end of `transport`.
///
/// Resolves with the peer's exposed value once both sides have completed the
/// handshake. Spawns the connection's routing task on the current runtime.
pub async fn expose(
    value: Value,
    transport: Transport,
    config: ExposeConfig,
) -> Result<Exposed, ConnectionError> {
    let (emitter, incoming) = transport.into_parts();
    let (init_tx, init_rx) = oneshot::channel();
    let state = ConnectionState::new(value, emitter, config, init_tx);
    tracing::debug!(local = %state.local(), "Announcing");
    state.announce()?;

    let shutdown = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Open);
    tokio::spawn(drive(state, incoming, shutdown.clone(), status_tx));

    let (remote, link) = init_rx.await.map_err(|_| ConnectionError::Closed)??;
    Ok(Exposed {
        remote,
        connection: Connection {
            link,
            shutdown,
            status: status_rx,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{BufferRef, ChannelRef};
    use crate::link::tests::RecordingEmitter;
    use crate::transport::NativePort;
    use bytes::Bytes;

    struct Harness {
        state: ConnectionState,
        emitter: Arc<RecordingEmitter>,
        init_rx: oneshot::Receiver<InitResult>,
        remote: Uuid,
    }

    fn harness(value: Value) -> Harness {
        let emitter = Arc::new(RecordingEmitter::default());
        let (init_tx, init_rx) = oneshot::channel();
        let state = ConnectionState::new(
            value,
            emitter.clone(),
            ExposeConfig::default(),
            init_tx,
        );
        state.announce().unwrap();
        Harness {
            state,
            emitter,
            init_rx,
            remote: Uuid::new_v4(),
        }
    }

    impl Harness {
        fn deliver(&mut self, message: Message, transfer: Vec<Transferable>) -> Result<(), ConnectionError> {
            self.state.handle(Incoming {
                envelope: Envelope::new(DEFAULT_KEY, self.remote, message),
                transfer,
            })
        }

        fn ready_native(&mut self) -> Result<(), ConnectionError> {
            let (port, _peer) = NativePort::pair();
            self.deliver(
                Message::Ready {
                    env_check: EnvCheck {
                        buffer: BufferRef::Transfer(0),
                        port: Some(ChannelRef::Transfer(1)),
                    },
                },
                vec![
                    Transferable::Buffer(Bytes::from_static(crate::capabilities::PROBE_BYTES)),
                    Transferable::Port(port),
                ],
            )
        }

        fn ready_stripped(&mut self) -> Result<(), ConnectionError> {
            self.deliver(
                Message::Ready {
                    env_check: EnvCheck {
                        buffer: BufferRef::Transfer(0),
                        port: Some(ChannelRef::Transfer(1)),
                    },
                },
                Vec::new(),
            )
        }

        fn capabilities(&self) -> Option<PlatformCapabilities> {
            self.state.link.as_ref().map(|link| link.capabilities())
        }
    }

    #[test]
    fn duplicate_ready_is_ignored() {
        let mut h = harness(Value::from(1));
        h.ready_native().unwrap();
        h.ready_stripped().unwrap();
        h.ready_native().unwrap();

        assert_eq!(h.emitter.names(), vec!["ready", "ready", "init"]);
        assert_eq!(h.capabilities(), Some(PlatformCapabilities::NATIVE));
    }

    #[test]
    fn stripped_probe_means_json_only() {
        let mut h = harness(Value::Null);
        h.ready_stripped().unwrap();

        assert_eq!(h.capabilities(), Some(PlatformCapabilities::JSON_ONLY));
    }

    #[test]
    fn ceiling_limits_capabilities() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (init_tx, _init_rx) = oneshot::channel();
        let mut state = ConnectionState::new(
            Value::Null,
            emitter,
            ExposeConfig::default().json_only(),
            init_tx,
        );
        let (port, _peer) = NativePort::pair();
        state
            .handle(Incoming {
                envelope: Envelope::new(
                    DEFAULT_KEY,
                    Uuid::new_v4(),
                    Message::Ready {
                        env_check: EnvCheck {
                            buffer: BufferRef::Transfer(0),
                            port: Some(ChannelRef::Transfer(1)),
                        },
                    },
                ),
                transfer: vec![
                    Transferable::Buffer(Bytes::from_static(crate::capabilities::PROBE_BYTES)),
                    Transferable::Port(port),
                ],
            })
            .unwrap();

        let caps = state.link.as_ref().map(|link| link.capabilities());
        assert_eq!(caps, Some(PlatformCapabilities::JSON_ONLY));
    }

    #[test]
    fn init_resolves_remote_value() {
        let mut h = harness(Value::Null);
        h.ready_stripped().unwrap();
        h.deliver(
            Message::Init {
                data: serde_json::json!({"answer": 42}),
            },
            Vec::new(),
        )
        .unwrap();

        assert_eq!(h.state.state(), HandshakeState::Ready);
        let (remote, _link) = h.init_rx.try_recv().unwrap().unwrap();
        assert_eq!(remote.get("answer").and_then(Value::as_i64), Some(42));
    }

    #[test]
    fn duplicate_init_is_fatal() {
        let mut h = harness(Value::Null);
        h.ready_stripped().unwrap();
        let init = || Message::Init {
            data: serde_json::Value::Null,
        };
        h.deliver(init(), Vec::new()).unwrap();

        assert!(matches!(
            h.deliver(init(), Vec::new()),
            Err(ConnectionError::Protocol(_))
        ));
    }

    #[test]
    fn traffic_before_ready_is_fatal() {
        let mut h = harness(Value::Null);
        let port_id = ChannelId::new(h.remote);

        for message in [
            Message::Init {
                data: serde_json::Value::Null,
            },
            Message::Data {
                port_id,
                data: serde_json::Value::Null,
            },
            Message::PortClosed { port_id },
        ] {
            assert!(matches!(
                h.deliver(message, Vec::new()),
                Err(ConnectionError::Protocol(_))
            ));
        }
    }

    #[test]
    fn unknown_channel_is_fatal() {
        let mut h = harness(Value::Null);
        h.ready_stripped().unwrap();
        let port_id = ChannelId::new(h.state.local());

        assert_eq!(
            h.deliver(
                Message::Data {
                    port_id,
                    data: serde_json::Value::Null,
                },
                Vec::new(),
            ),
            Err(ConnectionError::UnknownChannel(port_id))
        );
    }

    #[test]
    fn forged_channel_is_fatal() {
        let mut h = harness(Value::Null);
        h.ready_stripped().unwrap();
        let port_id = ChannelId::new(Uuid::new_v4());

        assert_eq!(
            h.deliver(Message::PortClosed { port_id }, Vec::new()),
            Err(ConnectionError::ForgedChannel(port_id))
        );
    }

    #[test]
    fn foreign_namespace_and_echoes_are_ignored() {
        let mut h = harness(Value::Null);
        let foreign = Incoming {
            envelope: Envelope::new(
                "other",
                h.remote,
                Message::Init {
                    data: serde_json::Value::Null,
                },
            ),
            transfer: Vec::new(),
        };
        let echo = Incoming {
            envelope: Envelope::new(
                DEFAULT_KEY,
                h.state.local(),
                Message::Init {
                    data: serde_json::Value::Null,
                },
            ),
            transfer: Vec::new(),
        };

        h.state.handle(foreign).unwrap();
        h.state.handle(echo).unwrap();
        assert_eq!(h.state.state(), HandshakeState::Announcing);
    }

    #[test]
    fn teardown_fails_pending_expose() {
        let mut h = harness(Value::Null);
        let status = h.state.teardown(Err(ConnectionError::protocol("boom")));

        assert_eq!(
            status,
            ConnectionStatus::Failed(ConnectionError::Protocol("boom".to_string()))
        );
        assert!(matches!(
            h.init_rx.try_recv(),
            Ok(Err(ConnectionError::Protocol(_)))
        ));
        assert_eq!(h.state.state(), HandshakeState::Closed);
    }
}
