//! Functions and the settlement frames shared with promises.
//!
//! The boxing side serves a function channel: each incoming frame carries
//! the call arguments and a fresh return channel, and is answered with one
//! settlement on that return channel. The reviving side wraps the channel in
//! a [`Callable`] proxy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError, box_packet};
use crate::bridge::protocol::ChannelRef;
use crate::channel::{Channel, ChannelError, ChannelReceiver, ChannelSender};
use crate::kind::Kind;
use crate::link::Link;
use crate::transport::Packet;
use crate::value::{CallError, Callable, ErrorValue, Function, Value};

/// One call on a function channel.
#[derive(Debug, Serialize, Deserialize)]
struct CallFrame {
    ret: ChannelRef,
    args: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(super) enum Settlement {
    Resolve { data: serde_json::Value },
    Reject { error: String },
}

pub(super) fn box_function(function: Function, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    let (channel, reference) = cx.open_channel(Kind::Function)?;
    tokio::spawn(serve_function(function, channel, Arc::clone(cx.link())));
    Ok(BoxKind::Function { channel: reference })
}

async fn serve_function(function: Function, mut channel: Channel, link: Arc<Link>) {
    let id = channel.id();
    while let Some(packet) = channel.recv().await {
        let function = function.clone();
        let link = Arc::clone(&link);
        // Calls run concurrently; a slow call doesn't hold up the next frame.
        tokio::spawn(async move {
            if let Err(e) = answer_call(function, packet, &link).await {
                tracing::warn!(channel = %id, error = %e, "Failed to answer call");
            }
        });
    }
    tracing::trace!(channel = %id, "Function released by peer");
}

async fn answer_call(function: Function, packet: Packet, link: &Arc<Link>) -> Result<(), ReviveError> {
    let Packet { data, transfer } = packet;
    let frame: CallFrame =
        serde_json::from_value(data).map_err(|e| ReviveError::Malformed(e.to_string()))?;

    let mut cx = ReviveCx::new(link, transfer);
    let ret = cx.attach_channel(frame.ret)?;
    let args = frame
        .args
        .into_iter()
        .map(|arg| cx.revive_value(arg))
        .collect::<Result<Vec<_>, _>>();
    drop(cx);

    let outcome = match args {
        Ok(args) => function.call(args).await,
        Err(e) => Err(CallError::Revive(e.to_string())),
    };
    settle(&ret.split().0, outcome, link)?;
    Ok(())
}

/// Send the single settlement for a call or promise.
pub(super) fn settle(
    sender: &ChannelSender,
    outcome: Result<Value, CallError>,
    link: &Arc<Link>,
) -> Result<(), ChannelError> {
    let packet = match outcome.map(|value| box_packet(link, value)) {
        Ok(Ok(Packet { data, transfer })) => {
            Packet::new(json!({"type": "resolve", "data": data}), transfer)
        }
        Ok(Err(e)) => {
            tracing::warn!(channel = %sender.id(), error = %e, "Failed to box settlement value");
            reject(CallError::Box(e.to_string()).into_error_value())
        }
        Err(e) => reject(e.into_error_value()),
    };
    sender.send(packet)
}

fn reject(error: ErrorValue) -> Packet {
    Packet::json(json!({"type": "reject", "error": error.render()}))
}

/// Wait for the single settlement on a return or promise channel.
pub(super) async fn await_settlement(
    receiver: &mut ChannelReceiver,
    link: &Arc<Link>,
) -> Result<Value, CallError> {
    let Packet { data, transfer } = receiver.recv().await.ok_or(CallError::Disconnected)?;
    let settlement: Settlement =
        serde_json::from_value(data).map_err(|e| CallError::Revive(e.to_string()))?;
    match settlement {
        Settlement::Resolve { data } => ReviveCx::new(link, transfer)
            .revive_value(data)
            .map_err(|e| CallError::Revive(e.to_string())),
        Settlement::Reject { error } => Err(CallError::Rejected(ErrorValue::from_rendered(&error))),
    }
}

pub(super) fn revive_function(
    reference: ChannelRef,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let (sender, _receiver) = cx.attach_channel(reference)?.split();
    Ok(Value::Function(Function::from_callable(RemoteFunction {
        sender,
        link: Arc::clone(cx.link()),
    })))
}

/// Proxy for a function living on the peer.
struct RemoteFunction {
    sender: ChannelSender,
    link: Arc<Link>,
}

#[async_trait]
impl Callable for RemoteFunction {
    async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        let (mut ret, packet) = {
            let mut cx = BoxCx::new(&self.link);
            let (ret, reference) = cx
                .open_channel(Kind::Promise)
                .map_err(|e| CallError::Box(e.to_string()))?;
            let args = args
                .into_iter()
                .map(|arg| cx.box_value(arg))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CallError::Box(e.to_string()))?;
            let frame = serde_json::to_value(CallFrame {
                ret: reference,
                args,
            })
            .map_err(|e| CallError::Box(e.to_string()))?;
            (ret.split().1, Packet::new(frame, cx.finish()))
        };

        self.sender
            .send(packet)
            .map_err(|_| CallError::Disconnected)?;
        // The return channel is released when `ret` drops.
        await_settlement(&mut ret, &self.link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_frames_parse() {
        let resolve: Settlement =
            serde_json::from_value(json!({"type": "resolve", "data": 5})).unwrap();
        assert!(matches!(resolve, Settlement::Resolve { data } if data == json!(5)));

        let reject: Settlement =
            serde_json::from_value(json!({"type": "reject", "error": "boom\nat f"})).unwrap();
        assert!(matches!(reject, Settlement::Reject { error } if error == "boom\nat f"));
    }
}
