//! Length-prefixed JSON transport over any byte stream.
//!
//! Declared JSON-only: byte streams cannot carry native handles, so the
//! capability probe is skipped and everything is routed by id.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{Emitter, Incoming, Transferable, Transport, TransportError};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::Envelope;

struct FramedEmitter {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Emitter for FramedEmitter {
    fn emit(&self, envelope: Envelope, transfer: Vec<Transferable>) -> Result<(), TransportError> {
        if !transfer.is_empty() {
            debug_assert!(false, "transferables passed to a JSON-only transport");
            tracing::error!(
                dropped = transfer.len(),
                "Bug: transferables passed to a JSON-only transport"
            );
        }
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }

    fn is_json(&self) -> bool {
        true
    }
}

/// Wrap a byte stream as a JSON-only transport.
///
/// Spawns the writer task, so this must be called inside a tokio runtime.
pub fn framed<T>(io: T) -> Transport
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Emit is synchronous; this task owns the write half and drains the queue.
    tokio::spawn(async move {
        let mut writer = FramedWrite::new(write, JsonCodec::<Envelope>::new());
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = writer.send(envelope).await {
                tracing::warn!(error = %e, "Failed to write envelope");
                break;
            }
        }
        tracing::trace!("Framed writer exiting");
    });

    let incoming = FramedRead::new(read, JsonCodec::<Envelope>::new()).map(|frame| {
        frame
            .map(|envelope| Incoming {
                envelope,
                transfer: Vec::new(),
            })
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => TransportError::Decode(e.to_string()),
                _ => TransportError::Io(e.to_string()),
            })
    });

    Transport::new(FramedEmitter { tx }, incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Message;
    use tokio::net::UnixStream;
    use uuid::Uuid;

    #[tokio::test]
    async fn framed_pair_exchanges_envelopes() {
        let (left, right) = UnixStream::pair().unwrap();
        let (left_emitter, _left_incoming) = framed(left).into_parts();
        let (_right_emitter, mut right_incoming) = framed(right).into_parts();

        let uuid = Uuid::new_v4();
        left_emitter
            .emit(
                Envelope::new(
                    "tether",
                    uuid,
                    Message::Init {
                        data: serde_json::json!([1, 2, 3]),
                    },
                ),
                Vec::new(),
            )
            .unwrap();

        let incoming = right_incoming.next().await.unwrap().unwrap();
        assert_eq!(incoming.envelope.uuid, uuid);
        assert!(incoming.transfer.is_empty());
        assert!(left_emitter.is_json());
    }

    #[tokio::test]
    async fn stream_ends_when_peer_closes() {
        let (left, right) = UnixStream::pair().unwrap();
        let left = framed(left);
        let (_right_emitter, mut right_incoming) = framed(right).into_parts();

        drop(left);
        // The writer task holds the write half until its queue closes.
        assert!(right_incoming.next().await.is_none());
    }
}
