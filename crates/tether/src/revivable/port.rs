//! Ports: a relay task pumps values between a local [`Port`] and a channel.

use std::sync::Arc;

use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError, box_packet, revive_packet};
use crate::bridge::protocol::ChannelRef;
use crate::channel::Channel;
use crate::kind::Kind;
use crate::link::Link;
use crate::value::{Port, Value};

pub(super) fn box_port(port: Port, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    let (channel, reference) = cx.open_channel(Kind::Port)?;
    tokio::spawn(relay(port, channel, Arc::clone(cx.link())));
    Ok(BoxKind::Port { channel: reference })
}

pub(super) fn revive_port(reference: ChannelRef, cx: &mut ReviveCx<'_>) -> Result<Value, ReviveError> {
    let channel = cx.attach_channel(reference)?;
    let (user, relay_end) = Port::pair();
    tokio::spawn(relay(relay_end, channel, Arc::clone(cx.link())));
    Ok(Value::Port(user))
}

/// Runs until either side closes; dropping the channel then tells the peer.
async fn relay(port: Port, channel: Channel, link: Arc<Link>) {
    let id = channel.id();
    let (tx, mut rx) = port.into_parts();
    let (sender, mut receiver) = channel.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(value) = outbound else { break };
                match box_packet(&link, value) {
                    Ok(packet) => {
                        if sender.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(channel = %id, error = %e, "Dropping unboxable port message"),
                }
            }
            inbound = receiver.recv() => {
                let Some(packet) = inbound else { break };
                match revive_packet(&link, packet) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(channel = %id, error = %e, "Dropping unrevivable port message"),
                }
            }
        }
    }
    tracing::trace!(channel = %id, "Port relay finished");
}
