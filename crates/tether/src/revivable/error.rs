use super::BoxKind;
use crate::value::{ErrorValue, Value};

pub(super) fn box_error(error: ErrorValue) -> BoxKind {
    BoxKind::Error {
        message: error.message().to_string(),
        stack: error.stack().map(str::to_owned),
    }
}

pub(super) fn revive_error(message: String, stack: Option<String>) -> Value {
    let error = ErrorValue::new(message);
    Value::Error(match stack {
        Some(stack) => error.with_stack(stack),
        None => error,
    })
}
