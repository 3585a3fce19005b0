//! Local handles on a sub-channel.
//!
//! A [`Channel`] splits into a sender and a receiver that share one
//! [`Finalizer`]. When the last of them is dropped the finalizer fires and
//! the connection releases the channel.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::ChannelError;
use crate::bridge::protocol::ChannelId;
use crate::link::Link;
use crate::transport::{NativePort, Packet};

/// Drop guard tying a channel's lifetime to the handles that use it.
pub(crate) struct Finalizer {
    slot: u32,
    link: Arc<Link>,
}

impl Finalizer {
    pub(crate) fn new(slot: u32, link: Arc<Link>) -> Self {
        Self { slot, link }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.link.finalize(self.slot);
    }
}

#[derive(Clone)]
enum Outbound {
    Native(mpsc::UnboundedSender<Packet>),
    Routed(Arc<Link>),
}

#[derive(Clone)]
pub(crate) struct ChannelSender {
    id: ChannelId,
    outbound: Outbound,
    _finalizer: Arc<Finalizer>,
}

impl ChannelSender {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        match &self.outbound {
            Outbound::Native(tx) => tx.send(packet).map_err(|_| ChannelError::Closed(self.id)),
            Outbound::Routed(link) => link.send_routed(self.id, packet),
        }
    }
}

pub(crate) struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Packet>,
    _finalizer: Arc<Finalizer>,
}

impl ChannelReceiver {
    /// Next packet, or `None` once the peer released its end.
    pub(crate) async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

pub(crate) struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub(crate) fn native(id: ChannelId, port: NativePort, finalizer: Finalizer) -> Self {
        let (tx, rx) = port.into_parts();
        Self::assemble(id, Outbound::Native(tx), rx, finalizer)
    }

    pub(crate) fn routed(
        id: ChannelId,
        link: Arc<Link>,
        rx: mpsc::UnboundedReceiver<Packet>,
        finalizer: Finalizer,
    ) -> Self {
        Self::assemble(id, Outbound::Routed(link), rx, finalizer)
    }

    fn assemble(
        id: ChannelId,
        outbound: Outbound,
        rx: mpsc::UnboundedReceiver<Packet>,
        finalizer: Finalizer,
    ) -> Self {
        let finalizer = Arc::new(finalizer);
        Self {
            sender: ChannelSender {
                id,
                outbound,
                _finalizer: Arc::clone(&finalizer),
            },
            receiver: ChannelReceiver {
                rx,
                _finalizer: finalizer,
            },
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.sender.id
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        self.sender.send(packet)
    }

    pub(crate) async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    pub(crate) fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}
