//! Prometheus metrics for reprise.
//!
//! Tracks how requests were served, upstream health and persistence failures.
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{debug, error};

lazy_static! {
    /// Requests handled, by how they were served
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "reprise_requests_total",
        "Total number of requests handled by the proxy",
        &["method", "outcome"]  // outcome: replayed|recorded|forwarded|no_recording|forward_error
    )
    .unwrap();

    /// Upstream failures by kind
    pub static ref FORWARD_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "reprise_forward_errors_total",
        "Total number of failed upstream requests",
        &["kind"]  // kind: connection-failed|timeout|upstream-protocol
    )
    .unwrap();

    /// Failed writes to the recording log
    pub static ref PERSISTENCE_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "reprise_persistence_errors_total",
        "Total number of recording persistence failures",
        &["operation"]  // operation: append|snapshot
    )
    .unwrap();

    /// Exchanges durably recorded
    pub static ref EXCHANGES_RECORDED_TOTAL: IntCounter = register_int_counter!(
        "reprise_exchanges_recorded_total",
        "Total number of exchanges recorded"
    )
    .unwrap();

    /// Upstream round trip, head and body
    pub static ref UPSTREAM_DURATION_MS: HistogramVec = register_histogram_vec!(
        "reprise_upstream_duration_ms",
        "Duration of upstream requests in milliseconds",
        &["method", "status"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(method: &str, outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[method, outcome]).inc();
}

pub fn record_forward_error(kind: &str) {
    FORWARD_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_persistence_error(operation: &str) {
    PERSISTENCE_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn record_exchange_recorded() {
    EXCHANGES_RECORDED_TOTAL.inc();
}

pub fn record_upstream_duration(method: &str, status: u16, duration_ms: u64) {
    UPSTREAM_DURATION_MS
        .with_label_values(&[method, &status.to_string()])
        .observe(duration_ms as f64);
}

async fn metrics_endpoint(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::new()));
    if req.method() == Method::GET && req.uri().path() == "/metrics" {
        *response.body_mut() = Full::new(Bytes::from(collect_metrics()));
        response.headers_mut().insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    } else {
        *response.status_mut() = StatusCode::NOT_FOUND;
    }
    Ok(response)
}

/// Serve `GET /metrics` on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Metrics listener accept failed: {}", e);
                continue;
            }
        };
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_endpoint))
                .await
            {
                debug!("Error serving metrics to {}: {}", remote_addr, err);
            }
        });
    }
}
