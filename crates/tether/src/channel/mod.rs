//! Sub-channel bookkeeping for one connection.
//!
//! The [`MessageChannelAllocator`] tracks every live sub-channel by
//! [`ChannelId`]. Routed channels (JSON-only transports) own an inbound queue
//! that the connection feeds from `message` envelopes; native channels are
//! tracked only so they can be counted and released.
//!
//! Closing is a two-step handshake so late messages are never mistaken for
//! protocol errors: the side that closes first marks its entry `Closing` and
//! sends `port-closed`; the peer removes its entry and acknowledges; the ack
//! removes the `Closing` entry. Messages that arrive for a `Closing` entry
//! are dropped.
//!
//! A peer-origin channel can be used and released before the envelope that
//! names it has been revived. Its entry is then held as `PeerClosed`: the
//! queued packets wait for the reader, which sees end-of-stream after them,
//! and the entry goes away once the reader is attached.

mod endpoint;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::protocol::ChannelId;
use crate::transport::{Packet, TransportError};

pub(crate) use endpoint::{Channel, ChannelReceiver, ChannelSender, Finalizer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ChannelId),
    #[error("channel {0} is already allocated")]
    Duplicate(ChannelId),
    #[error("channel {0} was never allocated")]
    Unknown(ChannelId),
    #[error("channel {0} does not belong to this connection")]
    Forged(ChannelId),
    #[error("channel {0} receiver already taken")]
    ReceiverTaken(ChannelId),
    #[error("channel {0} is not routed through the connection")]
    NotRouted(ChannelId),
    #[error("transfer slot {0} does not hold a port")]
    MissingTransfer(usize),
    #[error("handle table exhausted")]
    Exhausted,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How a channel's traffic moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Over a transferred native port; the connection never sees its data.
    Native,
    /// As `message` envelopes on the connection's transport.
    Routed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Open,
    /// Local end released; waiting for the peer's acknowledgement.
    Closing,
    /// Peer released before this side attached a reader.
    PeerClosed,
}

enum Inbound {
    Native,
    Routed {
        tx: Option<mpsc::UnboundedSender<Packet>>,
        rx: Option<mpsc::UnboundedReceiver<Packet>>,
    },
}

struct Entry {
    state: EntryState,
    inbound: Inbound,
}

impl Entry {
    fn new(route: Route) -> Self {
        let inbound = match route {
            Route::Native => Inbound::Native,
            Route::Routed => {
                let (tx, rx) = mpsc::unbounded_channel();
                Inbound::Routed {
                    tx: Some(tx),
                    rx: Some(rx),
                }
            }
        };
        Self {
            state: EntryState::Open,
            inbound,
        }
    }

    fn peer_closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            state: EntryState::PeerClosed,
            inbound: Inbound::Routed {
                tx: None,
                rx: Some(rx),
            },
        }
    }
}

/// Outcome of delivering a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Entry is closing or its reader is gone.
    Dropped,
}

/// What the local side must do after releasing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalClose {
    /// Routed entry is now `Closing`; send `port-closed`.
    NotifyPeer,
    /// Native entry removed; nothing to send.
    Released,
    /// Nothing to do (already closing, or gone).
    Absent,
}

/// What the local side must do after the peer sent `port-closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteClose {
    /// Peer closed first; entry removed, send the acknowledgement.
    Acknowledge,
    /// Peer closed before a reader attached; entry held for the reader,
    /// send the acknowledgement.
    Held,
    /// That was the acknowledgement of our own close.
    Removed,
    /// Nothing tracked under that id.
    Unknown,
}

pub(crate) struct MessageChannelAllocator {
    origin: Uuid,
    entries: DashMap<ChannelId, Entry>,
}

impl MessageChannelAllocator {
    pub(crate) fn new(origin: Uuid) -> Self {
        Self {
            origin,
            entries: DashMap::new(),
        }
    }

    /// Register a channel. Without an explicit id, a fresh one in this
    /// allocator's namespace is drawn until it doesn't collide.
    pub(crate) fn alloc(&self, id: Option<ChannelId>, route: Route) -> Result<ChannelId, ChannelError> {
        if let Some(id) = id {
            return match self.entries.entry(id) {
                MapEntry::Occupied(_) => Err(ChannelError::Duplicate(id)),
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Entry::new(route));
                    Ok(id)
                }
            };
        }

        loop {
            let id = ChannelId::new(self.origin);
            if let MapEntry::Vacant(vacant) = self.entries.entry(id) {
                vacant.insert(Entry::new(route));
                return Ok(id);
            }
            tracing::trace!(channel = %id, "Channel id collision, retrying");
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self, id: ChannelId) -> Option<EntryState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Register `id` unless it's already tracked. Returns true if created.
    pub(crate) fn get_or_alloc(&self, id: ChannelId, route: Route) -> bool {
        match self.entries.entry(id) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(route));
                true
            }
        }
    }

    /// Take the reader of a routed channel. A `PeerClosed` entry is
    /// removed once its reader is handed out.
    pub(crate) fn take_receiver(
        &self,
        id: ChannelId,
    ) -> Result<mpsc::UnboundedReceiver<Packet>, ChannelError> {
        let (rx, released) = {
            let mut entry = self
                .entries
                .get_mut(&id)
                .ok_or(ChannelError::Unknown(id))?;
            let released = entry.state == EntryState::PeerClosed;
            let rx = match &mut entry.inbound {
                Inbound::Native => return Err(ChannelError::NotRouted(id)),
                Inbound::Routed { rx, .. } => rx.take().ok_or(ChannelError::ReceiverTaken(id))?,
            };
            (rx, released)
        };
        if released {
            self.entries.remove(&id);
        }
        Ok(rx)
    }

    /// Queue a routed message for the channel's reader.
    pub(crate) fn deliver(&self, id: ChannelId, packet: Packet) -> Result<Delivery, ChannelError> {
        let entry = self.entries.get(&id).ok_or(ChannelError::Unknown(id))?;
        if entry.state != EntryState::Open {
            return Ok(Delivery::Dropped);
        }
        match &entry.inbound {
            Inbound::Native => Err(ChannelError::NotRouted(id)),
            Inbound::Routed { tx, .. } => Ok(match tx.as_ref().map(|tx| tx.send(packet)) {
                Some(Ok(())) => Delivery::Delivered,
                Some(Err(_)) | None => Delivery::Dropped,
            }),
        }
    }

    /// Run `emit` only while the channel is open.
    ///
    /// The entry stays locked for the duration, so a concurrent close can't
    /// slip its `port-closed` ahead of this message. `emit` must not call
    /// back into this connection; see [`Emitter`](crate::transport::Emitter).
    pub(crate) fn send_if_open<F>(&self, id: ChannelId, emit: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let entry = self.entries.get(&id).ok_or(ChannelError::Closed(id))?;
        if entry.state != EntryState::Open {
            return Err(ChannelError::Closed(id));
        }
        emit().map_err(ChannelError::Transport)
    }

    /// Local end released.
    pub(crate) fn close_local(&self, id: ChannelId) -> LocalClose {
        let native = match self.entries.get_mut(&id) {
            None => return LocalClose::Absent,
            Some(mut entry) => {
                if matches!(entry.inbound, Inbound::Native) {
                    true
                } else if entry.state != EntryState::Open {
                    return LocalClose::Absent;
                } else {
                    entry.state = EntryState::Closing;
                    false
                }
            }
        };
        if native {
            self.entries.remove(&id);
            LocalClose::Released
        } else {
            LocalClose::NotifyPeer
        }
    }

    /// Peer sent `port-closed`.
    pub(crate) fn close_remote(&self, id: ChannelId) -> RemoteClose {
        let MapEntry::Occupied(mut occupied) = self.entries.entry(id) else {
            return RemoteClose::Unknown;
        };
        match occupied.get().state {
            EntryState::Closing => {
                occupied.remove();
                RemoteClose::Removed
            }
            // Repeated close; the entry already waits for its reader.
            EntryState::PeerClosed => RemoteClose::Unknown,
            EntryState::Open => {
                let entry = occupied.get_mut();
                if let Inbound::Routed { tx, rx: Some(_) } = &mut entry.inbound {
                    *tx = None;
                    entry.state = EntryState::PeerClosed;
                    return RemoteClose::Held;
                }
                occupied.remove();
                RemoteClose::Acknowledge
            }
        }
    }

    /// Peer released `id` before anything arrived for it. Returns true if a
    /// `PeerClosed` entry was created for the reader to find.
    pub(crate) fn hold_closed(&self, id: ChannelId) -> bool {
        match self.entries.entry(id) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::peer_closed());
                true
            }
        }
    }

    /// Drop an entry outright. Idempotent.
    pub(crate) fn free(&self, id: ChannelId) {
        self.entries.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry; routed readers observe end-of-stream.
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
