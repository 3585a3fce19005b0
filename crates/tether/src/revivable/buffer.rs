//! Raw byte buffers: transferred under native capabilities, base64 otherwise.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use super::{BoxCx, BoxKind, ReviveCx, ReviveError};
use crate::bridge::protocol::BufferRef;
use crate::kind::Kind;
use crate::transport::Transferable;
use crate::value::Value;

pub(super) fn encode(bytes: Bytes, kind: Kind, cx: &mut BoxCx<'_>) -> BufferRef {
    if kind.transfers_natively(cx.capabilities()) {
        BufferRef::Transfer(cx.push_transfer(Transferable::Buffer(bytes)))
    } else {
        BufferRef::Base64(STANDARD.encode(&bytes))
    }
}

pub(super) fn decode(reference: BufferRef, cx: &mut ReviveCx<'_>) -> Result<Bytes, ReviveError> {
    match reference {
        BufferRef::Transfer(index) => match cx.take_transfer(index) {
            Some(Transferable::Buffer(bytes)) => Ok(bytes),
            _ => Err(ReviveError::MissingTransfer(index)),
        },
        BufferRef::Base64(text) => STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(|e| ReviveError::Base64(e.to_string())),
    }
}

pub(super) fn box_array_buffer(bytes: Bytes, cx: &mut BoxCx<'_>) -> BoxKind {
    BoxKind::ArrayBuffer {
        buffer: encode(bytes, Kind::ArrayBuffer, cx),
    }
}

pub(super) fn revive_array_buffer(
    buffer: BufferRef,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    decode(buffer, cx).map(Value::Bytes)
}
