//! Transport abstraction: anything that can carry envelopes between two peers.
//!
//! A [`Transport`] is split into an [`Emitter`] (outbound, synchronous and
//! non-blocking so it can be called from `Drop`) and a stream of [`Incoming`]
//! envelopes. Capable transports may carry [`Transferable`] handles alongside
//! an envelope; JSON-only transports cannot.

pub mod framed;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::bridge::protocol::Envelope;

pub use framed::framed;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// A handle moved (not copied) alongside an envelope.
#[derive(Debug)]
pub enum Transferable {
    Buffer(Bytes),
    Port(NativePort),
}

/// Data travelling over a sub-channel: boxed JSON plus its transfer list.
#[derive(Debug)]
pub struct Packet {
    pub data: serde_json::Value,
    pub transfer: Vec<Transferable>,
}

impl Packet {
    pub fn new(data: serde_json::Value, transfer: Vec<Transferable>) -> Self {
        Self { data, transfer }
    }

    pub fn json(data: serde_json::Value) -> Self {
        Self::new(data, Vec::new())
    }
}

/// One end of a natively transferable duplex port.
///
/// Dropping either end closes the other end's receiver.
#[derive(Debug)]
pub struct NativePort {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl NativePort {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }

    pub fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.tx.send(packet).map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Packet>,
        mpsc::UnboundedReceiver<Packet>,
    ) {
        (self.tx, self.rx)
    }
}

/// An envelope as received, with whatever handles survived the trip.
#[derive(Debug)]
pub struct Incoming {
    pub envelope: Envelope,
    pub transfer: Vec<Transferable>,
}

/// Outbound half of a transport.
///
/// `emit` may run while the connection holds a lock on the channel being
/// written to. It must queue or write the envelope and return without
/// delivering into the same connection synchronously. Delivery happens
/// through the receiving side's [`IncomingStream`].
pub trait Emitter: Send + Sync + 'static {
    fn emit(&self, envelope: Envelope, transfer: Vec<Transferable>) -> Result<(), TransportError>;

    /// Transport is declared JSON-only; skip the capability probe entirely.
    fn is_json(&self) -> bool {
        false
    }
}

impl<E: Emitter + ?Sized> Emitter for Arc<E> {
    fn emit(&self, envelope: Envelope, transfer: Vec<Transferable>) -> Result<(), TransportError> {
        (**self).emit(envelope, transfer)
    }

    fn is_json(&self) -> bool {
        (**self).is_json()
    }
}

pub type IncomingStream = BoxStream<'static, Result<Incoming, TransportError>>;

pub struct Transport {
    emitter: Arc<dyn Emitter>,
    incoming: IncomingStream,
}

impl Transport {
    pub fn new<E, S>(emitter: E, incoming: S) -> Self
    where
        E: Emitter,
        S: Stream<Item = Result<Incoming, TransportError>> + Send + 'static,
    {
        Self {
            emitter: Arc::new(emitter),
            incoming: incoming.boxed(),
        }
    }

    pub fn from_parts(emitter: Arc<dyn Emitter>, incoming: IncomingStream) -> Self {
        Self { emitter, incoming }
    }

    pub fn into_parts(self) -> (Arc<dyn Emitter>, IncomingStream) {
        (self.emitter, self.incoming)
    }

    pub fn is_json(&self) -> bool {
        self.emitter.is_json()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("is_json", &self.is_json())
            .finish_non_exhaustive()
    }
}

/// Adapt an mpsc receiver into an incoming stream.
pub(crate) fn receiver_stream(rx: mpsc::UnboundedReceiver<Incoming>) -> IncomingStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|incoming| (Ok(incoming), rx))
    })
    .boxed()
}
