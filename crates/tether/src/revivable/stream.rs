//! Readable streams, pulled one chunk at a time.
//!
//! The reader sends `pull` and gets one `{done, value?, error?}` reply per
//! request. Dropping the reader early sends `cancel`; the producer stops and
//! both ends release the channel.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError, box_packet};
use crate::bridge::protocol::ChannelRef;
use crate::channel::Channel;
use crate::kind::Kind;
use crate::link::Link;
use crate::transport::{Packet, Transferable};
use crate::value::{ErrorValue, ReadableStream, Value};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamRequest {
    Pull,
    Cancel,
}

#[derive(Debug, Deserialize)]
struct PullReply {
    done: bool,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

pub(super) fn box_stream(stream: ReadableStream, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    let (channel, reference) = cx.open_channel(Kind::ReadableStream)?;
    tokio::spawn(serve_stream(stream, channel, Arc::clone(cx.link())));
    Ok(BoxKind::ReadableStream { channel: reference })
}

async fn serve_stream(mut stream: ReadableStream, mut channel: Channel, link: Arc<Link>) {
    let id = channel.id();
    while let Some(packet) = channel.recv().await {
        match serde_json::from_value::<StreamRequest>(packet.data) {
            Ok(StreamRequest::Pull) => {
                let (reply, transfer, finished) = next_reply(&mut stream, &link).await;
                if channel.send(Packet::new(reply, transfer)).is_err() || finished {
                    break;
                }
            }
            Ok(StreamRequest::Cancel) => {
                tracing::debug!(channel = %id, "Stream cancelled by reader");
                break;
            }
            Err(e) => {
                tracing::warn!(channel = %id, error = %e, "Malformed stream request");
                break;
            }
        }
    }
    tracing::trace!(channel = %id, "Stream producer finished");
}

async fn next_reply(
    stream: &mut ReadableStream,
    link: &Arc<Link>,
) -> (serde_json::Value, Vec<Transferable>, bool) {
    match stream.next().await {
        Some(Ok(value)) => match box_packet(link, value) {
            Ok(Packet { data, transfer }) => (json!({"done": false, "value": data}), transfer, false),
            Err(e) => (json!({"done": true, "error": e.to_string()}), Vec::new(), true),
        },
        Some(Err(error)) => (
            json!({"done": true, "error": error.render()}),
            Vec::new(),
            true,
        ),
        None => (json!({"done": true}), Vec::new(), true),
    }
}

pub(super) fn revive_stream(
    reference: ChannelRef,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let reader = RemoteReader {
        channel: Some(cx.attach_channel(reference)?),
        link: Arc::clone(cx.link()),
    };
    Ok(Value::Stream(ReadableStream::new(futures::stream::unfold(
        reader, pull,
    ))))
}

struct RemoteReader {
    /// `None` once the stream has ended one way or another.
    channel: Option<Channel>,
    link: Arc<Link>,
}

impl Drop for RemoteReader {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            tracing::trace!(channel = %channel.id(), "Reader dropped early, cancelling");
            let _ = channel.send(Packet::json(json!({"type": "cancel"})));
        }
    }
}

async fn pull(mut reader: RemoteReader) -> Option<(Result<Value, ErrorValue>, RemoteReader)> {
    let channel = reader.channel.as_mut()?;
    if channel.send(Packet::json(json!({"type": "pull"}))).is_err() {
        reader.channel = None;
        return Some((Err(ErrorValue::new("stream producer is gone")), reader));
    }
    let Some(Packet { data, transfer }) = channel.recv().await else {
        reader.channel = None;
        return Some((Err(ErrorValue::new("stream producer is gone")), reader));
    };

    let reply = match serde_json::from_value::<PullReply>(data) {
        Ok(reply) => reply,
        Err(e) => {
            reader.channel = None;
            return Some((Err(ErrorValue::new(format!("malformed pull reply: {e}"))), reader));
        }
    };
    if let Some(error) = reply.error {
        reader.channel = None;
        return Some((Err(ErrorValue::from_rendered(&error)), reader));
    }
    if reply.done {
        reader.channel = None;
        return None;
    }

    let value = ReviveCx::new(&reader.link, transfer)
        .revive_value(reply.value.unwrap_or(serde_json::Value::Null));
    match value {
        Ok(value) => Some((Ok(value), reader)),
        Err(e) => {
            reader.channel = None;
            Some((Err(ErrorValue::new(e.to_string())), reader))
        }
    }
}
