//! Boxing and reviving values that aren't plain JSON.
//!
//! Boxing walks a [`Value`] and replaces every revivable kind with a
//! [`RevivableBox`]: a tagged JSON object that tells the peer how to rebuild
//! it. Live kinds (functions, promises, ports, streams, abort signals) also
//! get a sub-channel and a task that serves it. Reviving is the inverse.
//!
//! # Box shapes
//!
//! | type             | payload                                   |
//! |------------------|-------------------------------------------|
//! | `date`           | `iso`                                     |
//! | `error`          | `message`, `stack?`                       |
//! | `arrayBuffer`    | `buffer` (transfer index or base64)       |
//! | `typedArray`     | `arrayType`, `buffer`                     |
//! | `function`       | `channel`                                 |
//! | `promise`        | `channel`                                 |
//! | `port`           | `channel`                                 |
//! | `readableStream` | `channel`                                 |
//! | `abortSignal`    | `aborted`, `reason?`, `channel?`          |
//! | `headers`        | `entries`                                 |
//! | `request`        | `method`, `url`, `headers`, `body`        |
//! | `response`       | `status`, `statusText`, `headers`, `body` |

mod abort_signal;
mod buffer;
mod date;
mod error;
mod fetch;
mod function;
mod headers;
mod port;
mod promise;
mod stream;
mod typed_array;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{BufferRef, ChannelRef};
use crate::capabilities::PlatformCapabilities;
use crate::channel::{Channel, ChannelError};
use crate::kind::Kind;
use crate::link::Link;
use crate::transport::{Packet, Transferable};
use crate::value::{Map, TypedArrayError, TypedArrayKind, Value};

/// Key that marks a JSON object as a box.
pub const BOX_MARKER_KEY: &str = "__marker__";

const BOX_TYPES: [&str; 12] = [
    "date",
    "error",
    "arrayBuffer",
    "typedArray",
    "function",
    "promise",
    "port",
    "readableStream",
    "abortSignal",
    "headers",
    "request",
    "response",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxMarker {
    Revivable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevivableBox {
    #[serde(rename = "__marker__")]
    pub marker: BoxMarker,
    #[serde(flatten)]
    pub kind: BoxKind,
}

impl RevivableBox {
    pub fn new(kind: BoxKind) -> Self {
        Self {
            marker: BoxMarker::Revivable,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BoxKind {
    Date {
        iso: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    ArrayBuffer {
        buffer: BufferRef,
    },
    TypedArray {
        #[serde(rename = "arrayType")]
        array_type: TypedArrayKind,
        buffer: BufferRef,
    },
    Function {
        channel: ChannelRef,
    },
    Promise {
        channel: ChannelRef,
    },
    Port {
        channel: ChannelRef,
    },
    ReadableStream {
        channel: ChannelRef,
    },
    AbortSignal {
        aborted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelRef>,
    },
    Headers {
        entries: Vec<(String, String)>,
    },
    Request {
        method: String,
        url: String,
        headers: serde_json::Value,
        body: serde_json::Value,
    },
    Response {
        status: u16,
        #[serde(rename = "statusText")]
        status_text: String,
        headers: serde_json::Value,
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoxError {
    #[error("failed to open sub-channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to encode box: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviveError {
    #[error("no handler for box type {0:?}")]
    UnknownType(String),
    #[error("malformed box: {0}")]
    Malformed(String),
    #[error("transfer slot {0} is missing or holds the wrong kind of handle")]
    MissingTransfer(usize),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("invalid date {0:?}")]
    Date(String),
    #[error(transparent)]
    TypedArray(#[from] TypedArrayError),
    #[error("invalid header: {0}")]
    Header(String),
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid status {0}")]
    Status(u16),
    #[error("failed to attach sub-channel: {0}")]
    Channel(#[from] ChannelError),
}

/// True if `map` carries the box marker.
pub fn is_boxed(map: &serde_json::Map<String, serde_json::Value>) -> bool {
    map.get(BOX_MARKER_KEY).and_then(serde_json::Value::as_str) == Some("revivable")
}

/// Boxing state for one outgoing payload.
pub(crate) struct BoxCx<'a> {
    link: &'a Arc<Link>,
    transfer: Vec<Transferable>,
}

impl<'a> BoxCx<'a> {
    pub(crate) fn new(link: &'a Arc<Link>) -> Self {
        Self {
            link,
            transfer: Vec::new(),
        }
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        self.link
    }

    pub(crate) fn capabilities(&self) -> PlatformCapabilities {
        self.link.capabilities()
    }

    /// Append a transferable and return its index.
    pub(crate) fn push_transfer(&mut self, transferable: Transferable) -> usize {
        self.transfer.push(transferable);
        self.transfer.len() - 1
    }

    pub(crate) fn open_channel(&mut self, kind: Kind) -> Result<(Channel, ChannelRef), BoxError> {
        Ok(self.link.open_channel(kind, &mut self.transfer)?)
    }

    pub(crate) fn finish(self) -> Vec<Transferable> {
        self.transfer
    }

    pub(crate) fn box_value(&mut self, value: Value) -> Result<serde_json::Value, BoxError> {
        use serde_json::Value as Json;

        let kind = match value {
            Value::Null => return Ok(Json::Null),
            Value::Bool(b) => return Ok(Json::Bool(b)),
            Value::Number(n) => return Ok(Json::Number(n)),
            Value::String(s) => return Ok(Json::String(s)),
            Value::Array(items) => {
                return items
                    .into_iter()
                    .map(|item| self.box_value(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Json::Array);
            }
            Value::Object(map) => {
                if map.get(BOX_MARKER_KEY).and_then(Value::as_str) == Some("revivable")
                    && let Some(json) = plain_object(&map)
                {
                    tracing::trace!("Payload already boxed, passing through");
                    return Ok(json);
                }
                return map
                    .into_iter()
                    .map(|(key, value)| Ok((key, self.box_value(value)?)))
                    .collect::<Result<serde_json::Map<String, Json>, BoxError>>()
                    .map(Json::Object);
            }
            Value::Bytes(bytes) => buffer::box_array_buffer(bytes, self),
            Value::TypedArray(array) => typed_array::box_typed_array(array, self),
            Value::Date(date) => date::box_date(date),
            Value::Error(error) => error::box_error(error),
            Value::Function(function) => function::box_function(function, self)?,
            Value::Promise(promise) => promise::box_promise(promise, self)?,
            Value::Port(port) => port::box_port(port, self)?,
            Value::Stream(stream) => stream::box_stream(stream, self)?,
            Value::AbortSignal(signal) => abort_signal::box_signal(signal, self)?,
            Value::Headers(headers) => headers::box_headers(&headers),
            Value::Request(request) => fetch::box_request(request, self)?,
            Value::Response(response) => fetch::box_response(response, self)?,
        };

        serde_json::to_value(RevivableBox::new(kind)).map_err(|e| BoxError::Encode(e.to_string()))
    }
}

/// Reviving state for one incoming payload.
pub(crate) struct ReviveCx<'a> {
    link: &'a Arc<Link>,
    transfer: Vec<Option<Transferable>>,
}

impl<'a> ReviveCx<'a> {
    pub(crate) fn new(link: &'a Arc<Link>, transfer: Vec<Transferable>) -> Self {
        Self {
            link,
            transfer: transfer.into_iter().map(Some).collect(),
        }
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        self.link
    }

    pub(crate) fn take_transfer(&mut self, index: usize) -> Option<Transferable> {
        self.transfer.get_mut(index).and_then(Option::take)
    }

    pub(crate) fn attach_channel(&mut self, reference: ChannelRef) -> Result<Channel, ReviveError> {
        Ok(self.link.attach_channel(reference, &mut self.transfer)?)
    }

    pub(crate) fn revive_value(&mut self, json: serde_json::Value) -> Result<Value, ReviveError> {
        use serde_json::Value as Json;

        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(b)),
            Json::Number(n) => Ok(Value::Number(n)),
            Json::String(s) => Ok(Value::String(s)),
            Json::Array(items) => items
                .into_iter()
                .map(|item| self.revive_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Json::Object(map) if is_boxed(&map) => {
                let boxed = parse_box(map)?;
                self.revive_box(boxed.kind)
            }
            Json::Object(map) => map
                .into_iter()
                .map(|(key, value)| Ok((key, self.revive_value(value)?)))
                .collect::<Result<Map, ReviveError>>()
                .map(Value::Object),
        }
    }

    fn revive_box(&mut self, kind: BoxKind) -> Result<Value, ReviveError> {
        match kind {
            BoxKind::Date { iso } => date::revive_date(&iso),
            BoxKind::Error { message, stack } => Ok(error::revive_error(message, stack)),
            BoxKind::ArrayBuffer { buffer } => buffer::revive_array_buffer(buffer, self),
            BoxKind::TypedArray { array_type, buffer } => {
                typed_array::revive_typed_array(array_type, buffer, self)
            }
            BoxKind::Function { channel } => function::revive_function(channel, self),
            BoxKind::Promise { channel } => promise::revive_promise(channel, self),
            BoxKind::Port { channel } => port::revive_port(channel, self),
            BoxKind::ReadableStream { channel } => stream::revive_stream(channel, self),
            BoxKind::AbortSignal {
                aborted,
                reason,
                channel,
            } => abort_signal::revive_signal(aborted, reason, channel, self),
            BoxKind::Headers { entries } => headers::revive_headers(entries),
            BoxKind::Request {
                method,
                url,
                headers,
                body,
            } => fetch::revive_request(method, url, headers, body, self),
            BoxKind::Response {
                status,
                status_text,
                headers,
                body,
            } => fetch::revive_response(status, status_text, headers, body, self),
        }
    }
}

/// An object that already carries the marker, if it holds nothing live.
fn plain_object(map: &Map) -> Option<serde_json::Value> {
    map.iter()
        .map(|(key, value)| value.to_json().map(|json| (key.clone(), json)))
        .collect::<Option<serde_json::Map<_, _>>>()
        .map(serde_json::Value::Object)
}

fn parse_box(map: serde_json::Map<String, serde_json::Value>) -> Result<RevivableBox, ReviveError> {
    let tag = map
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ReviveError::Malformed("box without a type".to_string()))?;
    if !BOX_TYPES.contains(&tag) {
        return Err(ReviveError::UnknownType(tag.to_string()));
    }
    serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| ReviveError::Malformed(e.to_string()))
}

/// Box `value` for a sub-channel packet.
pub(crate) fn box_packet(link: &Arc<Link>, value: Value) -> Result<Packet, BoxError> {
    let mut cx = BoxCx::new(link);
    let data = cx.box_value(value)?;
    Ok(Packet::new(data, cx.finish()))
}

/// Revive a sub-channel packet.
pub(crate) fn revive_packet(link: &Arc<Link>, packet: Packet) -> Result<Value, ReviveError> {
    let Packet { data, transfer } = packet;
    ReviveCx::new(link, transfer).revive_value(data)
}
