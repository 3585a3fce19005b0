use std::sync::Arc;

use super::function::{await_settlement, settle};
use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError};
use crate::bridge::protocol::ChannelRef;
use crate::kind::Kind;
use crate::value::{Promise, Value};

pub(super) fn box_promise(promise: Promise, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    let (channel, reference) = cx.open_channel(Kind::Promise)?;
    let link = Arc::clone(cx.link());
    let id = channel.id();

    tokio::spawn(async move {
        let (sender, mut receiver) = channel.split();
        tokio::select! {
            outcome = promise => {
                if let Err(e) = settle(&sender, outcome, &link) {
                    tracing::debug!(channel = %id, error = %e, "Promise settled after peer released it");
                }
            }
            // The peer never sends on a promise channel; any wakeup means it let go.
            _ = receiver.recv() => {
                tracing::trace!(channel = %id, "Peer released promise before it settled");
            }
        }
    });

    Ok(BoxKind::Promise { channel: reference })
}

pub(super) fn revive_promise(
    reference: ChannelRef,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let channel = cx.attach_channel(reference)?;
    let link = Arc::clone(cx.link());
    Ok(Value::Promise(Promise::from_settlement(async move {
        // Holding the sender keeps the producer from seeing a release.
        let (_sender, mut receiver) = channel.split();
        await_settlement(&mut receiver, &link).await
    })))
}
