//! Per-connection context shared by every live handle.
//!
//! A [`Link`] exists once the handshake has identified the peer. It owns the
//! sub-channel table and the finalizer registry, and is what boxed values
//! and revived proxies hold on to.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use uuid::Uuid;

use crate::allocator::Allocator;
use crate::bridge::protocol::{ChannelId, ChannelRef, Envelope, Message};
use crate::capabilities::PlatformCapabilities;
use crate::channel::{
    Channel, ChannelError, Delivery, Finalizer, LocalClose, MessageChannelAllocator, RemoteClose,
    Route,
};
use crate::kind::Kind;
use crate::transport::{Emitter, NativePort, Packet, Transferable, TransportError};

struct Finalizers {
    table: Allocator<ChannelId>,
    /// Set on teardown; later finalizers are no-ops.
    closed: bool,
}

pub(crate) struct Link {
    key: String,
    local: Uuid,
    remote: Uuid,
    capabilities: PlatformCapabilities,
    emitter: Arc<dyn Emitter>,
    channels: MessageChannelAllocator,
    finalizers: StdMutex<Finalizers>,
}

impl Link {
    pub(crate) fn new(
        key: String,
        local: Uuid,
        remote: Uuid,
        capabilities: PlatformCapabilities,
        emitter: Arc<dyn Emitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            local,
            remote,
            capabilities,
            emitter,
            channels: MessageChannelAllocator::new(local),
            finalizers: StdMutex::new(Finalizers {
                table: Allocator::new(),
                closed: false,
            }),
        })
    }

    pub(crate) fn local(&self) -> Uuid {
        self.local
    }

    pub(crate) fn remote(&self) -> Uuid {
        self.remote
    }

    pub(crate) fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    pub(crate) fn live_channels(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn outstanding_handles(&self) -> usize {
        self.lock_finalizers().table.len()
    }

    fn lock_finalizers(&self) -> MutexGuard<'_, Finalizers> {
        // A panic while holding the lock can't leave the table half-updated.
        self.finalizers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit(
        &self,
        message: Message,
        transfer: Vec<Transferable>,
    ) -> Result<(), TransportError> {
        tracing::trace!(local = %self.local, message = message.name(), "Emitting envelope");
        self.emitter
            .emit(Envelope::new(self.key.clone(), self.local, message), transfer)
    }

    /// Open a new sub-channel for a value of `kind` being boxed.
    ///
    /// Under native capabilities the peer's end is appended to `transfer`;
    /// otherwise the channel is routed by id.
    pub(crate) fn open_channel(
        self: &Arc<Self>,
        kind: Kind,
        transfer: &mut Vec<Transferable>,
    ) -> Result<(Channel, ChannelRef), ChannelError> {
        if kind.transfers_natively(self.capabilities) {
            let (local, remote) = NativePort::pair();
            let id = self.channels.alloc(None, Route::Native)?;
            let channel = self.native_channel(id, local)?;
            transfer.push(Transferable::Port(remote));
            Ok((channel, ChannelRef::Transfer(transfer.len() - 1)))
        } else {
            let id = self.channels.alloc(None, Route::Routed)?;
            let channel = self.routed_channel(id)?;
            Ok((channel, ChannelRef::PortId(id)))
        }
    }

    /// Attach to a sub-channel referenced by a box being revived.
    pub(crate) fn attach_channel(
        self: &Arc<Self>,
        reference: ChannelRef,
        transfer: &mut [Option<Transferable>],
    ) -> Result<Channel, ChannelError> {
        match reference {
            ChannelRef::Transfer(index) => {
                let port = match transfer.get_mut(index).map(Option::take) {
                    Some(Some(Transferable::Port(port))) => port,
                    Some(other) => {
                        // Put back whatever was there; it wasn't ours to take.
                        if let Some(slot) = transfer.get_mut(index) {
                            *slot = other;
                        }
                        return Err(ChannelError::MissingTransfer(index));
                    }
                    None => return Err(ChannelError::MissingTransfer(index)),
                };
                let id = self.channels.alloc(None, Route::Native)?;
                self.native_channel(id, port)
            }
            ChannelRef::PortId(id) => {
                self.check_namespace(id)?;
                self.channels.get_or_alloc(id, Route::Routed);
                self.routed_channel(id)
            }
        }
    }

    fn register(self: &Arc<Self>, id: ChannelId) -> Result<Finalizer, ChannelError> {
        let mut finalizers = self.lock_finalizers();
        if finalizers.closed {
            return Err(ChannelError::Closed(id));
        }
        let slot = finalizers
            .table
            .alloc(id)
            .map_err(|_| ChannelError::Exhausted)?;
        Ok(Finalizer::new(slot, Arc::clone(self)))
    }

    fn native_channel(
        self: &Arc<Self>,
        id: ChannelId,
        port: NativePort,
    ) -> Result<Channel, ChannelError> {
        match self.register(id) {
            Ok(finalizer) => Ok(Channel::native(id, port, finalizer)),
            Err(e) => {
                self.channels.free(id);
                Err(e)
            }
        }
    }

    fn routed_channel(self: &Arc<Self>, id: ChannelId) -> Result<Channel, ChannelError> {
        let rx = self.channels.take_receiver(id)?;
        match self.register(id) {
            Ok(finalizer) => Ok(Channel::routed(id, Arc::clone(self), rx, finalizer)),
            Err(e) => {
                self.channels.free(id);
                Err(e)
            }
        }
    }

    pub(crate) fn send_routed(&self, id: ChannelId, packet: Packet) -> Result<(), ChannelError> {
        let Packet { data, transfer } = packet;
        self.channels.send_if_open(id, || {
            self.emit(Message::Data { port_id: id, data }, transfer)
        })
    }

    /// Called from [`Finalizer::drop`] once nothing references the channel.
    pub(crate) fn finalize(&self, slot: u32) {
        let id = {
            let mut finalizers = self.lock_finalizers();
            if finalizers.closed {
                return;
            }
            match finalizers.table.free(slot) {
                Ok(id) => id,
                Err(e) => {
                    debug_assert!(false, "finalizer fired twice for slot {slot}");
                    tracing::error!(slot, error = %e, "Bug: finalizer fired for a released handle");
                    return;
                }
            }
        };

        match self.channels.close_local(id) {
            LocalClose::NotifyPeer => {
                tracing::trace!(channel = %id, "Releasing routed channel");
                if let Err(e) = self.emit(Message::PortClosed { port_id: id }, Vec::new()) {
                    tracing::debug!(channel = %id, error = %e, "Could not notify peer of close");
                }
            }
            LocalClose::Released => {
                tracing::trace!(channel = %id, "Released native channel");
            }
            LocalClose::Absent => {}
        }
    }

    /// Route an incoming `message` envelope to its channel.
    pub(crate) fn route(&self, id: ChannelId, packet: Packet) -> Result<(), ChannelError> {
        self.check_namespace(id)?;
        if id.origin() == self.remote {
            // The box naming this channel may still be queued for revival;
            // buffer until it attaches.
            self.channels.get_or_alloc(id, Route::Routed);
        }
        match self.channels.deliver(id, packet)? {
            Delivery::Delivered => {}
            Delivery::Dropped => {
                tracing::trace!(channel = %id, "Dropped message for released channel");
            }
        }
        Ok(())
    }

    /// Handle an incoming `port-closed` envelope.
    pub(crate) fn remote_closed(&self, id: ChannelId) -> Result<(), ChannelError> {
        self.check_namespace(id)?;
        let acknowledge = match self.channels.close_remote(id) {
            RemoteClose::Acknowledge => {
                tracing::trace!(channel = %id, "Peer released channel, acknowledging");
                true
            }
            RemoteClose::Held => {
                tracing::trace!(channel = %id, "Peer released channel before attach, holding");
                true
            }
            RemoteClose::Removed => {
                tracing::trace!(channel = %id, "Peer acknowledged close");
                false
            }
            // The box naming this channel may still be queued for revival.
            RemoteClose::Unknown if id.origin() == self.remote && self.channels.hold_closed(id) => {
                tracing::trace!(channel = %id, "Peer released channel before first use, holding");
                true
            }
            RemoteClose::Unknown => {
                tracing::trace!(channel = %id, "Close for channel already released");
                false
            }
        };
        if acknowledge {
            self.acknowledge_close(id);
        }
        Ok(())
    }

    fn acknowledge_close(&self, id: ChannelId) {
        if let Err(e) = self.emit(Message::PortClosed { port_id: id }, Vec::new()) {
            tracing::debug!(channel = %id, error = %e, "Could not acknowledge close");
        }
    }

    fn check_namespace(&self, id: ChannelId) -> Result<(), ChannelError> {
        if id.origin() == self.local || id.origin() == self.remote {
            Ok(())
        } else {
            Err(ChannelError::Forged(id))
        }
    }

    /// Connection is gone: stop finalization and release every channel.
    pub(crate) fn shutdown(&self) {
        let released = {
            let mut finalizers = self.lock_finalizers();
            finalizers.closed = true;
            finalizers.table.drain()
        };
        tracing::debug!(
            local = %self.local,
            handles = released.len(),
            channels = self.channels.len(),
            "Releasing connection resources"
        );
        self.channels.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every emitted envelope with its transfer count.
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub(crate) sent: Mutex<Vec<(Envelope, usize)>>,
    }

    impl RecordingEmitter {
        pub(crate) fn names(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(envelope, _)| envelope.message.name())
                .collect()
        }
    }

    impl Emitter for RecordingEmitter {
        fn emit(
            &self,
            envelope: Envelope,
            transfer: Vec<Transferable>,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((envelope, transfer.len()));
            Ok(())
        }
    }

    pub(crate) fn link(capabilities: PlatformCapabilities) -> (Arc<Link>, Arc<RecordingEmitter>) {
        let emitter = Arc::new(RecordingEmitter::default());
        let link = Link::new(
            "tether".to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            capabilities,
            emitter.clone(),
        );
        (link, emitter)
    }

    #[test]
    fn routed_channel_closes_with_port_closed() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let mut transfer = Vec::new();
        let (channel, reference) = link.open_channel(Kind::Function, &mut transfer).unwrap();

        assert!(transfer.is_empty());
        assert!(matches!(reference, ChannelRef::PortId(id) if id.origin() == link.local()));
        assert_eq!(link.outstanding_handles(), 1);

        drop(channel);
        assert_eq!(link.outstanding_handles(), 0);
        assert_eq!(emitter.names(), vec!["port-closed"]);
        // Entry lingers as closing until the peer acknowledges.
        assert_eq!(link.live_channels(), 1);

        let id = match reference {
            ChannelRef::PortId(id) => id,
            ChannelRef::Transfer(_) => unreachable!(),
        };
        link.remote_closed(id).unwrap();
        assert_eq!(link.live_channels(), 0);
        assert_eq!(emitter.names(), vec!["port-closed"]);
    }

    #[test]
    fn native_channel_transfers_port() {
        let (link, emitter) = link(PlatformCapabilities::NATIVE);
        let mut transfer = Vec::new();
        let (channel, reference) = link.open_channel(Kind::Promise, &mut transfer).unwrap();

        assert_eq!(reference, ChannelRef::Transfer(0));
        assert!(matches!(transfer.as_slice(), [Transferable::Port(_)]));

        drop(channel);
        assert_eq!(link.live_channels(), 0);
        assert!(emitter.names().is_empty());
    }

    #[test]
    fn peer_close_is_acknowledged() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let id = ChannelId::new(link.remote());
        let mut transfer = Vec::new();
        let channel = link
            .attach_channel(ChannelRef::PortId(id), &mut transfer)
            .unwrap();

        link.remote_closed(id).unwrap();
        assert_eq!(emitter.names(), vec!["port-closed"]);

        // Our later release finds nothing left to close.
        drop(channel);
        assert_eq!(emitter.names(), vec!["port-closed"]);
        assert_eq!(link.live_channels(), 0);
    }

    #[test]
    fn forged_namespace_is_rejected() {
        let (link, _emitter) = link(PlatformCapabilities::JSON_ONLY);
        let forged = ChannelId::new(Uuid::new_v4());
        let mut transfer = Vec::new();

        assert!(matches!(
            link.attach_channel(ChannelRef::PortId(forged), &mut transfer),
            Err(ChannelError::Forged(id)) if id == forged
        ));
        assert_eq!(
            link.route(forged, Packet::json(serde_json::Value::Null)),
            Err(ChannelError::Forged(forged))
        );
    }

    #[test]
    fn missing_transfer_is_an_error() {
        let (link, _emitter) = link(PlatformCapabilities::NATIVE);
        let mut transfer = vec![Some(Transferable::Buffer(bytes::Bytes::new()))];

        assert_eq!(
            link.attach_channel(ChannelRef::Transfer(0), &mut transfer)
                .err(),
            Some(ChannelError::MissingTransfer(0))
        );
        assert!(matches!(transfer[0], Some(Transferable::Buffer(_))));
    }

    #[tokio::test]
    async fn routed_send_reaches_peer_table() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let mut transfer = Vec::new();
        let (mut channel, reference) = link.open_channel(Kind::Port, &mut transfer).unwrap();
        let id = match reference {
            ChannelRef::PortId(id) => id,
            ChannelRef::Transfer(_) => unreachable!(),
        };

        channel.send(Packet::json(serde_json::json!("out"))).unwrap();
        assert_eq!(emitter.names(), vec!["message"]);

        link.route(id, Packet::json(serde_json::json!("in"))).unwrap();
        assert_eq!(channel.recv().await.unwrap().data, serde_json::json!("in"));
    }

    #[tokio::test]
    async fn early_peer_messages_wait_for_attach() {
        let (link, _emitter) = link(PlatformCapabilities::JSON_ONLY);
        let id = ChannelId::new(link.remote());

        link.route(id, Packet::json(serde_json::json!(1))).unwrap();
        let mut transfer = Vec::new();
        let mut channel = link
            .attach_channel(ChannelRef::PortId(id), &mut transfer)
            .unwrap();

        assert_eq!(channel.recv().await.unwrap().data, serde_json::json!(1));
    }

    #[tokio::test]
    async fn settlement_survives_close_before_attach() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let id = ChannelId::new(link.remote());

        // Peer settles and releases before the envelope naming the channel
        // has been revived here.
        link.route(id, Packet::json(serde_json::json!({"status": "fulfilled"})))
            .unwrap();
        link.remote_closed(id).unwrap();
        assert_eq!(emitter.names(), vec!["port-closed"]);

        let mut transfer = Vec::new();
        let mut channel = link
            .attach_channel(ChannelRef::PortId(id), &mut transfer)
            .unwrap();
        assert_eq!(link.live_channels(), 0);
        assert_eq!(
            channel.recv().await.unwrap().data,
            serde_json::json!({"status": "fulfilled"})
        );
        assert!(channel.recv().await.is_none());

        drop(channel);
        assert_eq!(link.outstanding_handles(), 0);
        assert_eq!(emitter.names(), vec!["port-closed"]);
    }

    #[tokio::test]
    async fn close_before_first_use_ends_the_attached_reader() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let id = ChannelId::new(link.remote());

        link.remote_closed(id).unwrap();
        assert_eq!(emitter.names(), vec!["port-closed"]);
        assert_eq!(link.live_channels(), 1);

        let mut transfer = Vec::new();
        let mut channel = link
            .attach_channel(ChannelRef::PortId(id), &mut transfer)
            .unwrap();
        assert!(channel.recv().await.is_none());
        assert_eq!(link.live_channels(), 0);
    }

    #[test]
    fn close_for_released_local_channel_is_ignored() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);

        link.remote_closed(ChannelId::new(link.local())).unwrap();
        assert!(emitter.names().is_empty());
        assert_eq!(link.live_channels(), 0);
    }

    #[test]
    fn unallocated_local_channel_is_unknown() {
        let (link, _emitter) = link(PlatformCapabilities::JSON_ONLY);
        let id = ChannelId::new(link.local());

        assert_eq!(
            link.route(id, Packet::json(serde_json::Value::Null)),
            Err(ChannelError::Unknown(id))
        );
    }

    #[test]
    fn shutdown_disarms_finalizers() {
        let (link, emitter) = link(PlatformCapabilities::JSON_ONLY);
        let mut transfer = Vec::new();
        let (channel, _) = link.open_channel(Kind::Function, &mut transfer).unwrap();

        link.shutdown();
        assert_eq!(link.live_channels(), 0);
        assert_eq!(link.outstanding_handles(), 0);

        drop(channel);
        assert!(emitter.names().is_empty());
        assert!(link.open_channel(Kind::Function, &mut transfer).is_err());
    }
}
