//! The value model carried across a connection.
//!
//! [`Value`] is plain JSON data plus the live kinds that need a handler to
//! cross the wire: binary buffers, dates, errors, functions, promises, ports,
//! streams, abort signals and fetch primitives.

mod abort;
mod error;
mod fetch;
mod function;
mod port;
mod promise;
mod stream;
mod typed_array;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;

use crate::kind::Kind;

pub use abort::{AbortController, AbortSignal};
pub use error::{ErrorValue, StackTrace};
pub use fetch::{Request, Response};
pub use function::{CallError, Callable, Function};
pub use port::{Port, PortClosed};
pub use promise::Promise;
pub use stream::ReadableStream;
pub use typed_array::{Element, TypedArray, TypedArrayError, TypedArrayKind};

pub type Map = BTreeMap<String, Value>;

pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    Bytes(Bytes),
    TypedArray(TypedArray),
    Date(DateTime<Utc>),
    Error(ErrorValue),
    Function(Function),
    Promise(Promise),
    Port(Port),
    Stream(ReadableStream),
    AbortSignal(AbortSignal),
    Headers(HeaderMap),
    Request(Request),
    Response(Response),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
            Value::Bytes(_) => Kind::ArrayBuffer,
            Value::TypedArray(_) => Kind::TypedArray,
            Value::Date(_) => Kind::Date,
            Value::Error(_) => Kind::Error,
            Value::Function(_) => Kind::Function,
            Value::Promise(_) => Kind::Promise,
            Value::Port(_) => Kind::Port,
            Value::Stream(_) => Kind::ReadableStream,
            Value::AbortSignal(_) => Kind::AbortSignal,
            Value::Headers(_) => Kind::Headers,
            Value::Request(_) => Kind::Request,
            Value::Response(_) => Kind::Response,
        }
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_typed_array(&self) -> Option<&TypedArray> {
        match self {
            Value::TypedArray(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(date) => Some(date),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_signal(&self) -> Option<&AbortSignal> {
        match self {
            Value::AbortSignal(signal) => Some(signal),
            _ => None,
        }
    }

    pub fn as_headers(&self) -> Option<&HeaderMap> {
        match self {
            Value::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    /// Object field lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Remove and return an object field, for kinds that can't be borrowed
    /// out (promises, ports, streams).
    pub fn take(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.remove(key),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_promise(self) -> Option<Promise> {
        match self {
            Value::Promise(promise) => Some(promise),
            _ => None,
        }
    }

    pub fn into_port(self) -> Option<Port> {
        match self {
            Value::Port(port) => Some(port),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<ReadableStream> {
        match self {
            Value::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn into_request(self) -> Option<Request> {
        match self {
            Value::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Value::Response(response) => Some(response),
            _ => None,
        }
    }

    /// Plain JSON view, or `None` if anything inside needs a handler.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<_>>()?,
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<_>>()?,
            ),
            _ => return None,
        })
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n.into())
                }
            }
        )*
    };
}

from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<TypedArray> for Value {
    fn from(array: TypedArray) -> Self {
        Value::TypedArray(array)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Value::Error(error)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::Promise(promise)
    }
}

impl From<Port> for Value {
    fn from(port: Port) -> Self {
        Value::Port(port)
    }
}

impl From<ReadableStream> for Value {
    fn from(stream: ReadableStream) -> Self {
        Value::Stream(stream)
    }
}

impl From<AbortSignal> for Value {
    fn from(signal: AbortSignal) -> Self {
        Value::AbortSignal(signal)
    }
}

impl From<HeaderMap> for Value {
    fn from(headers: HeaderMap) -> Self {
        Value::Headers(headers)
    }
}

impl From<Request> for Value {
    fn from(request: Request) -> Self {
        Value::Request(request)
    }
}

impl From<Response> for Value {
    fn from(response: Response) -> Self {
        Value::Response(response)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(map) => f.debug_map().entries(map).finish(),
            Value::Bytes(bytes) => write!(f, "Bytes(len={})", bytes.len()),
            Value::TypedArray(array) => {
                write!(f, "TypedArray({:?}, len={})", array.kind(), array.len())
            }
            Value::Date(date) => write!(f, "Date({})", date.to_rfc3339()),
            Value::Error(error) => f.debug_tuple("Error").field(&error.message()).finish(),
            Value::Function(function) => function.fmt(f),
            Value::Promise(promise) => promise.fmt(f),
            Value::Port(port) => port.fmt(f),
            Value::Stream(stream) => stream.fmt(f),
            Value::AbortSignal(signal) => signal.fmt(f),
            Value::Headers(headers) => f.debug_tuple("Headers").field(headers).finish(),
            Value::Request(request) => request.fmt(f),
            Value::Response(response) => response.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_classification() {
        assert_eq!(Value::from(1).kind(), Kind::Number);
        assert_eq!(Value::from(Bytes::new()).kind(), Kind::ArrayBuffer);
        assert_eq!(Value::from(Utc::now()).kind(), Kind::Date);
        assert_eq!(Value::from(Port::pair().0).kind(), Kind::Port);
        assert_eq!(
            Value::from(ReadableStream::from_values(Vec::new())).kind(),
            Kind::ReadableStream
        );
    }

    #[test]
    fn json_conversion_roundtrips_plain_data() {
        let json = json!({"a": [1, "two", null, true], "b": {"c": 2.5}});
        let value = Value::from(json.clone());

        assert_eq!(value.get("b").and_then(|b| b.get("c")).and_then(Value::as_f64), Some(2.5));
        assert_eq!(value.to_json(), Some(json));
    }

    #[test]
    fn to_json_refuses_live_values() {
        let value = Value::object([("when", Value::from(Utc::now()))]);
        assert!(value.to_json().is_none());
    }

    #[test]
    fn non_finite_float_is_null() {
        assert!(Value::from(f64::NAN).is_null());
    }

    #[test]
    fn take_removes_field() {
        let mut value = Value::object([("p", Value::from(Promise::resolved(Value::Null)))]);
        assert!(value.take("p").and_then(Value::into_promise).is_some());
        assert!(value.get("p").is_none());
    }
}
