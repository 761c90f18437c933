//! HTTP edge of the proxy: hyper request in, hyper response out.
//!
//! Bodies are buffered completely before matching, and every response is
//! written from a fully buffered body, so hyper frames it itself.

use super::controller::{Outcome, ProxyController};
use super::headers::{end_to_end, RepriseHeadersExt, VALUE_TRUE, X_REPRISE_RECORDED, X_REPRISE_REPLAYED};
use crate::config::RecordingConfig;
use crate::metrics;
use crate::recording::{header_list, RecordedRequest, RecordedResponse};
use crate::response::ErrorResponseBuilder;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt::Display;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RequestHandler {
    controller: ProxyController,
    no_recording_status: StatusCode,
    annotate: bool,
}

impl RequestHandler {
    pub fn new(controller: ProxyController, recording: &RecordingConfig) -> Self {
        let no_recording_status =
            StatusCode::from_u16(recording.no_recording_status).unwrap_or(StatusCode::BAD_GATEWAY);
        Self {
            controller,
            no_recording_status,
            annotate: recording.annotate_responses,
        }
    }

    pub fn controller(&self) -> &ProxyController {
        &self.controller
    }

    /// Handle one request. Never fails: every outcome becomes a response.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let method = parts.method.as_str().to_string();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body for {} {}: {}", method, parts.uri, e);
                metrics::record_request(&method, "bad_request");
                return Ok(ErrorResponseBuilder::new(StatusCode::BAD_REQUEST)
                    .error("bad-request", "failed to read request body")
                    .build());
            }
        };

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        debug!("Received request: {} {}", method, target);

        let request = RecordedRequest {
            method: method.clone(),
            target: target.to_string(),
            headers: header_list(&parts.headers),
            body,
        };

        let outcome = self.controller.handle(request).await;
        metrics::record_request(&method, outcome.label());
        Ok(self.render(outcome, &method))
    }

    fn render(&self, outcome: Outcome, method: &str) -> Response<Full<Bytes>> {
        match outcome {
            Outcome::Replayed(exchange) => {
                let mut response = to_http(&exchange.response, method);
                if self.annotate {
                    response.set_header(&X_REPRISE_REPLAYED, &VALUE_TRUE);
                }
                response
            }
            Outcome::Forwarded { response, recorded } => {
                let mut response = to_http(&response, method);
                if self.annotate && recorded.is_some() {
                    response.set_header(&X_REPRISE_RECORDED, &VALUE_TRUE);
                }
                response
            }
            Outcome::NoRecording => ErrorResponseBuilder::new(self.no_recording_status)
                .error(
                    "no-recording",
                    "no recorded exchange matches this request",
                )
                .build(),
            Outcome::ForwardFailed(e) => {
                metrics::record_forward_error(e.kind());
                ErrorResponseBuilder::new(e.status())
                    .error(e.kind(), &e.to_string())
                    .build()
            }
        }
    }
}

/// Rebuild an HTTP response from a recorded one, answering a `method` request.
///
/// Hop-by-hop headers are dropped. The recorded `content-length` is dropped too,
/// so hyper frames the buffered body, except for HEAD where it describes a body
/// that was never sent. Duplicates survive, and values of the same name keep
/// their recorded order. `HeaderMap` groups values by name, so the order
/// between different names is not preserved.
pub fn to_http(recorded: &RecordedResponse, method: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(recorded.body.clone()));

    match StatusCode::from_u16(recorded.status) {
        Ok(status) => *response.status_mut() = status,
        Err(_) => {
            warn!("Recorded status {} is not valid HTTP", recorded.status);
            *response.status_mut() = StatusCode::BAD_GATEWAY;
        }
    }

    let status = response.status();
    let canonical = status.canonical_reason().unwrap_or_default();
    if !recorded.reason.is_empty() && recorded.reason != canonical {
        if let Ok(reason) = ReasonPhrase::try_from(recorded.reason.clone()) {
            response.extensions_mut().insert(reason);
        }
    }

    let drop: &[&str] = if method.eq_ignore_ascii_case("HEAD") {
        &[]
    } else {
        &["content-length"]
    };
    let headers = response.headers_mut();
    for header in end_to_end(&recorded.headers, drop) {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("Skipping unwritable recorded header '{}'", header.name),
        }
    }

    response
}
