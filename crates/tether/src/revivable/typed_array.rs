use super::buffer;
use super::{BoxCx, BoxKind, ReviveCx, ReviveError};
use crate::bridge::protocol::BufferRef;
use crate::kind::Kind;
use crate::value::{TypedArray, TypedArrayKind, Value};

pub(super) fn box_typed_array(array: TypedArray, cx: &mut BoxCx<'_>) -> BoxKind {
    let array_type = array.kind();
    BoxKind::TypedArray {
        array_type,
        buffer: buffer::encode(array.into_bytes(), Kind::TypedArray, cx),
    }
}

pub(super) fn revive_typed_array(
    array_type: TypedArrayKind,
    reference: BufferRef,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let bytes = buffer::decode(reference, cx)?;
    Ok(Value::TypedArray(TypedArray::new(array_type, bytes)?))
}
