//! Requests and responses: metadata inline, headers and body as nested boxes.

use http::{HeaderMap, Method, StatusCode};

use super::{BoxCx, BoxError, BoxKind, ReviveCx, ReviveError};
use crate::value::{ReadableStream, Request, Response, Value};

pub(super) fn box_request(request: Request, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    Ok(BoxKind::Request {
        method: request.method.as_str().to_owned(),
        url: request.url,
        headers: cx.box_value(Value::Headers(request.headers))?,
        body: box_body(request.body, cx)?,
    })
}

pub(super) fn box_response(response: Response, cx: &mut BoxCx<'_>) -> Result<BoxKind, BoxError> {
    Ok(BoxKind::Response {
        status: response.status.as_u16(),
        status_text: response.status_text,
        headers: cx.box_value(Value::Headers(response.headers))?,
        body: box_body(response.body, cx)?,
    })
}

fn box_body(
    body: Option<ReadableStream>,
    cx: &mut BoxCx<'_>,
) -> Result<serde_json::Value, BoxError> {
    match body {
        Some(stream) => cx.box_value(Value::Stream(stream)),
        None => Ok(serde_json::Value::Null),
    }
}

pub(super) fn revive_request(
    method: String,
    url: String,
    headers: serde_json::Value,
    body: serde_json::Value,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ReviveError::Method(method))?;
    Ok(Value::Request(Request {
        method,
        url,
        headers: revive_headers(headers, cx)?,
        body: revive_body(body, cx)?,
    }))
}

pub(super) fn revive_response(
    status: u16,
    status_text: String,
    headers: serde_json::Value,
    body: serde_json::Value,
    cx: &mut ReviveCx<'_>,
) -> Result<Value, ReviveError> {
    let status = StatusCode::from_u16(status).map_err(|_| ReviveError::Status(status))?;
    Ok(Value::Response(Response {
        status,
        status_text,
        headers: revive_headers(headers, cx)?,
        body: revive_body(body, cx)?,
    }))
}

fn revive_headers(json: serde_json::Value, cx: &mut ReviveCx<'_>) -> Result<HeaderMap, ReviveError> {
    match cx.revive_value(json)? {
        Value::Headers(headers) => Ok(headers),
        other => Err(ReviveError::Malformed(format!(
            "expected headers, found {:?}",
            other.kind()
        ))),
    }
}

fn revive_body(
    json: serde_json::Value,
    cx: &mut ReviveCx<'_>,
) -> Result<Option<ReadableStream>, ReviveError> {
    match cx.revive_value(json)? {
        Value::Null => Ok(None),
        Value::Stream(stream) => Ok(Some(stream)),
        other => Err(ReviveError::Malformed(format!(
            "expected a body stream, found {:?}",
            other.kind()
        ))),
    }
}
