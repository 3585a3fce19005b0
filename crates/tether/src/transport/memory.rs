//! In-process transports.
//!
//! [`pair`] behaves like a structured-clone message port: transferables move
//! intact. [`json_pair`] pushes every envelope through JSON text and drops
//! transferables, which is how a plain text channel behaves. Neither declares
//! itself JSON-only, so both exercise the capability probe.

use tokio::sync::mpsc;

use super::{Emitter, Incoming, Transferable, Transport, TransportError, receiver_stream};
use crate::bridge::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Native,
    Json,
}

struct MemoryEmitter {
    tx: mpsc::UnboundedSender<Incoming>,
    mode: Mode,
}

impl Emitter for MemoryEmitter {
    fn emit(&self, envelope: Envelope, transfer: Vec<Transferable>) -> Result<(), TransportError> {
        let incoming = match self.mode {
            Mode::Native => Incoming { envelope, transfer },
            Mode::Json => {
                if !transfer.is_empty() {
                    tracing::trace!(
                        dropped = transfer.len(),
                        "Text channel dropping transferables"
                    );
                }
                let text = serde_json::to_string(&envelope)
                    .map_err(|e| TransportError::Encode(e.to_string()))?;
                let envelope = serde_json::from_str(&text)
                    .map_err(|e| TransportError::Decode(e.to_string()))?;
                Incoming {
                    envelope,
                    transfer: Vec::new(),
                }
            }
        };
        self.tx.send(incoming).map_err(|_| TransportError::Closed)
    }
}

fn connect(mode: Mode) -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Transport::new(MemoryEmitter { tx: b_tx, mode }, receiver_stream(a_rx)),
        Transport::new(MemoryEmitter { tx: a_tx, mode }, receiver_stream(b_rx)),
    )
}

/// Two connected endpoints that carry transferables.
pub fn pair() -> (Transport, Transport) {
    connect(Mode::Native)
}

/// Two connected endpoints that only carry JSON text.
pub fn json_pair() -> (Transport, Transport) {
    connect(Mode::Json)
}

/// A transport that delivers everything it emits back to itself.
///
/// Used for capability probing.
pub fn loopback() -> Transport {
    let (tx, rx) = mpsc::unbounded_channel();
    Transport::new(
        MemoryEmitter {
            tx,
            mode: Mode::Native,
        },
        receiver_stream(rx),
    )
}

/// Loopback that behaves like a text channel.
pub fn json_loopback() -> Transport {
    let (tx, rx) = mpsc::unbounded_channel();
    Transport::new(
        MemoryEmitter {
            tx,
            mode: Mode::Json,
        },
        receiver_stream(rx),
    )
}
