use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use super::{BoxKind, ReviveError};
use crate::value::Value;

/// Headers travel as ordered `[name, value]` pairs; repeated names survive.
pub(super) fn box_headers(headers: &HeaderMap) -> BoxKind {
    let entries = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    BoxKind::Headers { entries }
}

pub(super) fn revive_headers(entries: Vec<(String, String)>) -> Result<Value, ReviveError> {
    let mut headers = HeaderMap::with_capacity(entries.len());
    for (name, value) in entries {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ReviveError::Header(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ReviveError::Header(format!("{name}: {e}")))?;
        headers.append(name, value);
    }
    Ok(Value::Headers(headers))
}
