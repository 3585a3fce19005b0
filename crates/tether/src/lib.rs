//! tether: bidirectional RPC and value marshalling over message transports.
//!
//! Each side calls [`expose`] with a value and a [`Transport`]; once the
//! handshake completes it receives the peer's value. Functions, promises,
//! ports, streams and abort signals inside either value stay live across the
//! connection, riding on sub-channels that are released when the local
//! handle is dropped.

pub mod allocator;
pub mod bridge;
pub mod capabilities;
mod channel;
pub mod connection;
pub mod kind;
mod link;
pub mod revivable;
pub mod transport;
pub mod value;

pub use capabilities::{PlatformCapabilities, probe_capabilities};
pub use channel::ChannelError;
pub use connection::{
    Connection, ConnectionError, ConnectionStatus, ExposeConfig, Exposed, HandshakeState, expose,
};
pub use kind::Kind;
pub use transport::{Transport, TransportError};
pub use value::{
    AbortController, AbortSignal, CallError, ErrorValue, Function, Port, Promise, ReadableStream,
    Request, Response, TypedArray, Value,
};
