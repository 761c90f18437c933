//! Request forwarding to the upstream server.
//!
//! The forwarder only relays: it never records and never retries. Recording is
//! the controller's job.

use super::client::{create_http_client, HttpClient};
use super::headers::end_to_end;
use crate::config::{Config, ConfigError, UpstreamTarget};
use crate::recording::{header_list, RecordedRequest, RecordedResponse};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, StatusCode};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("could not connect to upstream: {0}")]
    ConnectionFailed(String),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
}

impl ForwardError {
    /// Value of the `x-reprise-error` header and the metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::ConnectionFailed(_) => "connection-failed",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::UpstreamProtocolError(_) => "upstream-protocol",
        }
    }

    /// Status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::ConnectionFailed(_) | ForwardError::UpstreamProtocolError(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// Sends a request to the real upstream and returns its complete response.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &RecordedRequest) -> Result<RecordedResponse, ForwardError>;
}

/// Forwarder backed by the pooled hyper client.
pub struct HttpForwarder {
    client: HttpClient,
    target: UpstreamTarget,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(client: HttpClient, target: UpstreamTarget, timeout: Duration) -> Self {
        Self {
            client,
            target,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            create_http_client(&config.connection_pool),
            config.upstream.target()?,
            config.upstream.timeout(),
        ))
    }

    fn build_request(
        &self,
        request: &RecordedRequest,
    ) -> Result<Request<Full<Bytes>>, ForwardError> {
        let uri = self.target.join(&request.target);
        let mut builder = Request::builder()
            .method(request.method.as_str())
            .uri(uri.as_str());

        // Host is rewritten by the client for the upstream authority.
        for header in end_to_end(&request.headers, &["host"]) {
            match (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(&header.value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Dropping unforwardable header '{}'", header.name),
            }
        }

        builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| {
                ForwardError::UpstreamProtocolError(format!("invalid request for {uri}: {e}"))
            })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &RecordedRequest) -> Result<RecordedResponse, ForwardError> {
        let upstream_req = self.build_request(request)?;
        debug!("Forwarding to: {}", upstream_req.uri());

        let started = Instant::now();
        let exchange = async {
            let response = self
                .client
                .request(upstream_req)
                .await
                .map_err(classify_client_error)?;

            let reason = response
                .extensions()
                .get::<ReasonPhrase>()
                .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned());
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    ForwardError::UpstreamProtocolError(format!("failed to read upstream body: {e}"))
                })?
                .to_bytes();
            Ok::<_, ForwardError>((parts, reason, body))
        };

        let (parts, reason, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ForwardError::Timeout(self.timeout))??;

        let mut response = RecordedResponse::new(parts.status.as_u16());
        if let Some(reason) = reason {
            response.reason = reason;
        }
        response.headers = header_list(&parts.headers);
        response.body = body;
        response.latency_ms = Some(started.elapsed().as_millis() as u64);
        Ok(response)
    }
}

fn classify_client_error(err: hyper_util::client::legacy::Error) -> ForwardError {
    if err.is_connect() {
        debug!("Upstream connect error: {:?}", err);
        return ForwardError::ConnectionFailed(error_chain(&err));
    }
    ForwardError::UpstreamProtocolError(error_chain(&err))
}

/// `err` and its sources joined with ": ".
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
