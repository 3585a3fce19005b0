//! Abort signals: state travels inline, a later abort over a channel.

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError};
use crate::bridge::protocol::ChannelRef;
use crate::kind::Kind;
use crate::transport::Packet;
use crate::value::{AbortController, AbortSignal, Value};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AbortNotice {
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub(super) fn box_signal(signal: AbortSignal, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    if signal.is_aborted() {
        return Ok(BoxKind::AbortSignal {
            aborted: true,
            reason: signal.reason().map(str::to_owned),
            channel: None,
        });
    }

    let (channel, reference) = cx.open_channel(Kind::AbortSignal)?;
    let id = channel.id();
    let watched = signal.clone();
    tokio::spawn(async move {
        let (sender, mut receiver) = channel.split();
        tokio::select! {
            // An abort wins over the controller drop that may follow it.
            biased;
            _ = watched.aborted() => {
                let notice = json!({"type": "abort", "reason": watched.reason()});
                if let Err(e) = sender.send(Packet::json(notice)) {
                    tracing::debug!(channel = %id, error = %e, "Could not forward abort");
                }
            }
            _ = watched.orphaned() => {
                tracing::trace!(channel = %id, "Abort controller dropped without aborting");
            }
            _ = receiver.recv() => {
                tracing::trace!(channel = %id, "Peer released abort signal");
            }
        }
    });

    Ok(BoxKind::AbortSignal {
        aborted: false,
        reason: None,
        channel: Some(reference),
    })
}

pub(super) fn revive_signal(
    aborted: bool,
    reason: Option<String>,
    channel: Option<ChannelRef>,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let controller = AbortController::new();

    if aborted {
        controller.abort(reason);
        return Ok(Value::AbortSignal(controller.signal()));
    }

    let reference = channel.ok_or_else(|| {
        ReviveError::Malformed("live abort signal without a channel".to_string())
    })?;
    let mut channel = cx.attach_channel(reference)?;
    let unobserved = CancellationToken::new();
    let signal = controller
        .signal()
        .observed_by(unobserved.clone().drop_guard());
    tokio::spawn(async move {
        let id = channel.id();
        let packet = tokio::select! {
            packet = channel.recv() => packet,
            _ = unobserved.cancelled() => {
                tracing::trace!(channel = %id, "Abort signal dropped before aborting");
                return;
            }
        };
        let Some(packet) = packet else {
            tracing::trace!(channel = %id, "Abort signal released without aborting");
            return;
        };
        match serde_json::from_value::<AbortNotice>(packet.data) {
            Ok(AbortNotice::Abort { reason }) => controller.abort(reason),
            Err(e) => tracing::warn!(channel = %id, error = %e, "Malformed abort notice"),
        }
    });

    Ok(Value::AbortSignal(signal))
}
