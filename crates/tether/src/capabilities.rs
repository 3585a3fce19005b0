//! What a transport can carry natively.
//!
//! Capabilities are observed, not configured: each side sends a probe buffer
//! and port in its `ready` envelope and the receiver checks which of them
//! arrived as live handles. A configured ceiling can only narrow the result.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::protocol::{BufferRef, ChannelRef, EnvCheck, Envelope, Message};
use crate::transport::{Emitter, IncomingStream, NativePort, Transferable, Transport};

/// Bytes carried by the buffer probe.
pub const PROBE_BYTES: &[u8] = b"tether-probe";

const PROBE_KEY: &str = "tether-probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Message ports can be transferred.
    pub ports: bool,
    /// Binary buffers can be transferred without base64.
    pub buffers: bool,
}

impl PlatformCapabilities {
    pub const NATIVE: Self = Self {
        ports: true,
        buffers: true,
    };

    pub const JSON_ONLY: Self = Self {
        ports: false,
        buffers: false,
    };

    pub fn json_only(&self) -> bool {
        !self.ports && !self.buffers
    }

    /// Keep only what both sides allow.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            ports: self.ports && other.ports,
            buffers: self.buffers && other.buffers,
        }
    }

    /// Probe payload for a `ready` envelope.
    ///
    /// JSON-only emitters get an inline payload so nothing transferable is
    /// handed to them.
    pub(crate) fn probe_payload(json: bool) -> (EnvCheck, Vec<Transferable>) {
        if json {
            let check = EnvCheck {
                buffer: BufferRef::Base64(STANDARD.encode(PROBE_BYTES)),
                port: None,
            };
            return (check, Vec::new());
        }

        let (port, _discard) = NativePort::pair();
        let check = EnvCheck {
            buffer: BufferRef::Transfer(0),
            port: Some(ChannelRef::Transfer(1)),
        };
        let transfer = vec![
            Transferable::Buffer(Bytes::from_static(PROBE_BYTES)),
            Transferable::Port(port),
        ];
        (check, transfer)
    }

    /// Derive capabilities from a received probe payload.
    pub(crate) fn observe(check: &EnvCheck, transfer: &[Transferable]) -> Self {
        let buffers = match check.buffer {
            BufferRef::Transfer(index) => matches!(
                transfer.get(index),
                Some(Transferable::Buffer(bytes)) if bytes.as_ref() == PROBE_BYTES
            ),
            BufferRef::Base64(_) => false,
        };
        let ports = match check.port {
            Some(ChannelRef::Transfer(index)) => {
                matches!(transfer.get(index), Some(Transferable::Port(_)))
            }
            _ => false,
        };
        Self { ports, buffers }
    }
}

/// Probe a loopback transport, one feature at a time.
///
/// Each probe sends a self-addressed message carrying the candidate handle
/// and waits up to `timeout` for it. A probe that fails to send, or doesn't
/// come back in time, reports the feature as unsupported.
pub async fn probe_capabilities(transport: Transport, timeout: Duration) -> PlatformCapabilities {
    let (emitter, mut incoming) = transport.into_parts();
    if emitter.is_json() {
        tracing::debug!("Transport declared JSON-only, skipping probe");
        return PlatformCapabilities::JSON_ONLY;
    }

    let buffers = probe_feature(
        emitter.as_ref(),
        &mut incoming,
        Transferable::Buffer(Bytes::from_static(PROBE_BYTES)),
        timeout,
    )
    .await
    .buffers;

    let (port, _discard) = NativePort::pair();
    let ports = probe_feature(
        emitter.as_ref(),
        &mut incoming,
        Transferable::Port(port),
        timeout,
    )
    .await
    .ports;

    let capabilities = PlatformCapabilities { ports, buffers };
    tracing::debug!(?capabilities, "Probed platform capabilities");
    capabilities
}

async fn probe_feature(
    emitter: &dyn Emitter,
    incoming: &mut IncomingStream,
    probe: Transferable,
    timeout: Duration,
) -> PlatformCapabilities {
    let id = Uuid::new_v4();
    let check = match probe {
        Transferable::Buffer(_) => EnvCheck {
            buffer: BufferRef::Transfer(0),
            port: None,
        },
        Transferable::Port(_) => EnvCheck {
            buffer: BufferRef::Base64(String::new()),
            port: Some(ChannelRef::Transfer(0)),
        },
    };
    let envelope = Envelope::new(
        PROBE_KEY,
        id,
        Message::Ready {
            env_check: check.clone(),
        },
    );
    if let Err(e) = emitter.emit(envelope, vec![probe]) {
        tracing::debug!(error = %e, "Probe emit failed");
        return PlatformCapabilities::JSON_ONLY;
    }

    let echoed = tokio::time::timeout(timeout, async {
        while let Some(next) = incoming.next().await {
            match next {
                Ok(incoming) if incoming.envelope.uuid == id => return Some(incoming),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Probe transport failed");
                    return None;
                }
            }
        }
        None
    })
    .await;

    match echoed {
        Ok(Some(incoming)) => PlatformCapabilities::observe(&check, &incoming.transfer),
        Ok(None) => PlatformCapabilities::JSON_ONLY,
        Err(_) => {
            tracing::debug!(?timeout, "Probe timed out");
            PlatformCapabilities::JSON_ONLY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    #[test]
    fn intersect_narrows() {
        let ceiling = PlatformCapabilities {
            ports: false,
            buffers: true,
        };
        assert_eq!(PlatformCapabilities::NATIVE.intersect(ceiling), ceiling);
        assert!(
            PlatformCapabilities::JSON_ONLY
                .intersect(PlatformCapabilities::NATIVE)
                .json_only()
        );
    }

    #[test]
    fn observe_native_payload() {
        let (check, transfer) = PlatformCapabilities::probe_payload(false);
        assert_eq!(
            PlatformCapabilities::observe(&check, &transfer),
            PlatformCapabilities::NATIVE
        );
    }

    #[test]
    fn observe_stripped_payload() {
        let (check, _transfer) = PlatformCapabilities::probe_payload(false);
        assert_eq!(
            PlatformCapabilities::observe(&check, &[]),
            PlatformCapabilities::JSON_ONLY
        );
    }

    #[test]
    fn observe_json_payload() {
        let (check, transfer) = PlatformCapabilities::probe_payload(true);
        assert!(transfer.is_empty());
        assert!(PlatformCapabilities::observe(&check, &transfer).json_only());
    }

    #[tokio::test]
    async fn probe_loopback_is_native() {
        let caps = probe_capabilities(memory::loopback(), Duration::from_millis(500)).await;
        assert_eq!(caps, PlatformCapabilities::NATIVE);
    }

    #[tokio::test]
    async fn probe_text_loopback_is_json_only() {
        let caps = probe_capabilities(memory::json_loopback(), Duration::from_millis(500)).await;
        assert_eq!(caps, PlatformCapabilities::JSON_ONLY);
    }

    #[tokio::test]
    async fn probe_times_out_without_echo() {
        // One side of a pair never hears its own messages.
        let (a, _b) = memory::pair();
        let caps = probe_capabilities(a, Duration::from_millis(20)).await;
        assert_eq!(caps, PlatformCapabilities::JSON_ONLY);
    }
}
