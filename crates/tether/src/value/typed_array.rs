use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Element type of a typed array. Names match the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedArrayKind {
    #[serde(rename = "Int8Array")]
    Int8,
    #[serde(rename = "Uint8Array")]
    Uint8,
    #[serde(rename = "Uint8ClampedArray")]
    Uint8Clamped,
    #[serde(rename = "Int16Array")]
    Int16,
    #[serde(rename = "Uint16Array")]
    Uint16,
    #[serde(rename = "Int32Array")]
    Int32,
    #[serde(rename = "Uint32Array")]
    Uint32,
    #[serde(rename = "Float32Array")]
    Float32,
    #[serde(rename = "Float64Array")]
    Float64,
    #[serde(rename = "BigInt64Array")]
    BigInt64,
    #[serde(rename = "BigUint64Array")]
    BigUint64,
}

impl TypedArrayKind {
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 | Self::BigInt64 | Self::BigUint64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{len} bytes is not a whole number of {kind:?} elements")]
pub struct TypedArrayError {
    pub kind: TypedArrayKind,
    pub len: usize,
}

/// Rust scalar stored in a typed array (little-endian).
pub trait Element: Copy + Send + 'static {
    const KIND: TypedArrayKind;

    fn extend_le(self, out: &mut Vec<u8>);

    fn from_le(bytes: &[u8]) -> Option<Self>;
}

macro_rules! element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const KIND: TypedArrayKind = TypedArrayKind::$kind;

                fn extend_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn from_le(bytes: &[u8]) -> Option<Self> {
                    bytes.try_into().ok().map(<$ty>::from_le_bytes)
                }
            }
        )*
    };
}

element! {
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    f32 => Float32,
    f64 => Float64,
    i64 => BigInt64,
    u64 => BigUint64,
}

/// A typed view over a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedArray {
    kind: TypedArrayKind,
    bytes: Bytes,
}

impl TypedArray {
    pub fn new(kind: TypedArrayKind, bytes: impl Into<Bytes>) -> Result<Self, TypedArrayError> {
        let bytes = bytes.into();
        if bytes.len() % kind.element_size() != 0 {
            return Err(TypedArrayError {
                kind,
                len: bytes.len(),
            });
        }
        Ok(Self { kind, bytes })
    }

    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        let mut out = Vec::with_capacity(values.len() * T::KIND.element_size());
        for value in values {
            value.extend_le(&mut out);
        }
        Self {
            kind: T::KIND,
            bytes: out.into(),
        }
    }

    pub fn clamped(values: &[u8]) -> Self {
        Self {
            kind: TypedArrayKind::Uint8Clamped,
            bytes: Bytes::copy_from_slice(values),
        }
    }

    pub fn kind(&self) -> TypedArrayKind {
        self.kind
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the elements, or `None` if `T` doesn't match the element type.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        let compatible = T::KIND == self.kind
            || (T::KIND == TypedArrayKind::Uint8 && self.kind == TypedArrayKind::Uint8Clamped);
        if !compatible {
            return None;
        }
        self.bytes
            .chunks_exact(self.kind.element_size())
            .map(T::from_le)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_is_little_endian() {
        let array = TypedArray::from_slice(&[1u16, 0x0203]);
        assert_eq!(array.kind(), TypedArrayKind::Uint16);
        assert_eq!(array.bytes().as_ref(), &[1, 0, 3, 2]);
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn to_vec_checks_element_type() {
        let array = TypedArray::from_slice(&[1.5f64, -2.0]);
        assert_eq!(array.to_vec::<f64>(), Some(vec![1.5, -2.0]));
        assert_eq!(array.to_vec::<u64>(), None);
    }

    #[test]
    fn clamped_reads_as_u8() {
        let array = TypedArray::clamped(&[0, 255]);
        assert_eq!(array.to_vec::<u8>(), Some(vec![0, 255]));
    }

    #[test]
    fn ragged_length_is_rejected() {
        let err = TypedArray::new(TypedArrayKind::Int32, vec![0u8; 6]).unwrap_err();
        assert_eq!(
            err,
            TypedArrayError {
                kind: TypedArrayKind::Int32,
                len: 6
            }
        );
    }

    #[test]
    fn kind_uses_wire_names() {
        assert_eq!(
            serde_json::to_value(TypedArrayKind::BigUint64).unwrap(),
            serde_json::json!("BigUint64Array")
        );
    }
}
