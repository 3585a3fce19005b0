//! Value classification.
//!
//! Every [`Value`](crate::value::Value) maps to exactly one [`Kind`]. The kind
//! decides whether a value travels as plain JSON, as a revivable box, or as a
//! native transfer.

use crate::capabilities::PlatformCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    ArrayBuffer,
    TypedArray,
    Date,
    Error,
    Function,
    Promise,
    Port,
    ReadableStream,
    AbortSignal,
    Headers,
    Request,
    Response,
}

impl Kind {
    pub const ALL: [Kind; 18] = [
        Kind::Null,
        Kind::Bool,
        Kind::Number,
        Kind::String,
        Kind::Array,
        Kind::Object,
        Kind::ArrayBuffer,
        Kind::TypedArray,
        Kind::Date,
        Kind::Error,
        Kind::Function,
        Kind::Promise,
        Kind::Port,
        Kind::ReadableStream,
        Kind::AbortSignal,
        Kind::Headers,
        Kind::Request,
        Kind::Response,
    ];

    /// Needs a handler to cross the wire (anything that isn't plain JSON).
    pub fn is_revivable(self) -> bool {
        !matches!(
            self,
            Kind::Null | Kind::Bool | Kind::Number | Kind::String | Kind::Array | Kind::Object
        )
    }

    /// Walked recursively when boxing.
    pub fn is_container(self) -> bool {
        matches!(self, Kind::Array | Kind::Object)
    }

    /// Boxed regardless of transport capabilities.
    pub fn always_boxed(self) -> bool {
        matches!(
            self,
            Kind::Function | Kind::Promise | Kind::Date | Kind::Error
        )
    }

    /// Carried as a native transfer under `caps` rather than inline or routed.
    pub fn transfers_natively(self, caps: PlatformCapabilities) -> bool {
        match self {
            Kind::ArrayBuffer | Kind::TypedArray => caps.buffers,
            Kind::Function
            | Kind::Promise
            | Kind::Port
            | Kind::ReadableStream
            | Kind::AbortSignal => caps.ports,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_kinds_are_not_revivable() {
        let plain: Vec<_> = Kind::ALL
            .into_iter()
            .filter(|kind| !kind.is_revivable())
            .collect();
        assert_eq!(
            plain,
            vec![
                Kind::Null,
                Kind::Bool,
                Kind::Number,
                Kind::String,
                Kind::Array,
                Kind::Object
            ]
        );
    }

    #[test]
    fn always_boxed_kinds_never_transfer_buffers() {
        for kind in Kind::ALL.into_iter().filter(|k| k.always_boxed()) {
            assert!(kind.is_revivable());
            assert!(!kind.transfers_natively(PlatformCapabilities {
                ports: false,
                buffers: true,
            }));
        }
    }

    #[test]
    fn json_only_transfers_nothing() {
        for kind in Kind::ALL {
            assert!(!kind.transfers_natively(PlatformCapabilities::JSON_ONLY));
        }
    }

    #[test]
    fn native_transfers_buffers_and_channels() {
        let caps = PlatformCapabilities::NATIVE;
        assert!(Kind::ArrayBuffer.transfers_natively(caps));
        assert!(Kind::Port.transfers_natively(caps));
        assert!(!Kind::Date.transfers_natively(caps));
        assert!(!Kind::Headers.transfers_natively(caps));
    }
}
