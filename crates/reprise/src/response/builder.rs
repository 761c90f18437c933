//! Responses generated by the proxy itself rather than replayed or forwarded.

use crate::proxy::headers::X_REPRISE_ERROR;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::http::HeaderValue;
use hyper::{HeaderMap, Response, StatusCode};

/// Builds the responses Reprise generates itself (misses, upstream failures).
pub struct ErrorResponseBuilder {
    status: StatusCode,
    body: Option<Bytes>,
    headers: HeaderMap,
}

impl ErrorResponseBuilder {
    pub fn new(status_code: StatusCode) -> Self {
        ErrorResponseBuilder {
            status: status_code,
            body: None,
            headers: Default::default(),
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// `x-reprise-error: <kind>` plus a JSON body `{"error": kind, "message": ...}`.
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(kind) {
            self.headers.insert(X_REPRISE_ERROR.clone(), value);
        }
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let payload = serde_json::json!({ "error": kind, "message": message });
        self.body(payload.to_string())
    }

    pub fn build(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body.unwrap_or_default()));
        *response.status_mut() = self.status;
        response.headers_mut().extend(self.headers);
        response
    }
}
