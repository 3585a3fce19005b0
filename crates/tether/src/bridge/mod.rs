//! Wire protocol between two connection endpoints.
//!
//! # Architecture
//!
//! - **protocol**: Envelope and message types (ready, init, message, port-closed)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
