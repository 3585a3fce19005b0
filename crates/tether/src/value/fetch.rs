use http::{HeaderMap, Method, StatusCode};

use super::ReadableStream;

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<ReadableStream>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: ReadableStream) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Option<ReadableStream>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: ReadableStream) -> Self {
        self.body = Some(body);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_text_defaults_to_canonical_reason() {
        let response = Response::new(StatusCode::NOT_FOUND);
        assert_eq!(response.status_text, "Not Found");
        assert!(response.body.is_none());
    }
}
