//! Per-request record/replay decision.
//!
//! `Received -> Matching -> {Replaying | Forwarding} -> Recording -> Responding`.
//! The controller works on fully buffered [`RecordedRequest`]s and returns an
//! [`Outcome`]; turning that into HTTP is the handler's job.

use super::forwarding::{ForwardError, Forwarder};
use crate::config::FingerprintConfig;
use crate::matcher::{match_request, MatchResult};
use crate::metrics;
use crate::recording::{
    fingerprint, Exchange, ExchangeStore, Fingerprint, ProxyMode, RecordedRequest,
    RecordedResponse,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to one request.
#[derive(Debug)]
pub enum Outcome {
    /// Served from a recording
    Replayed(Arc<Exchange>),
    /// Live upstream response; `recorded` is `None` when persisting it failed
    Forwarded {
        response: RecordedResponse,
        recorded: Option<Arc<Exchange>>,
    },
    /// Miss in `replay_only` mode
    NoRecording,
    ForwardFailed(ForwardError),
}

impl Outcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Replayed(_) => "replayed",
            Outcome::Forwarded {
                recorded: Some(_), ..
            } => "recorded",
            Outcome::Forwarded { recorded: None, .. } => "forwarded",
            Outcome::NoRecording => "no_recording",
            Outcome::ForwardFailed(_) => "forward_error",
        }
    }
}

#[derive(Clone)]
pub struct ProxyController {
    mode: ProxyMode,
    store: Arc<ExchangeStore>,
    forwarder: Arc<dyn Forwarder>,
    fingerprint: Arc<FingerprintConfig>,
}

impl ProxyController {
    pub fn new(
        mode: ProxyMode,
        store: Arc<ExchangeStore>,
        forwarder: Arc<dyn Forwarder>,
        fingerprint: FingerprintConfig,
    ) -> Self {
        Self {
            mode,
            store,
            forwarder,
            fingerprint: Arc::new(fingerprint),
        }
    }

    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<ExchangeStore> {
        &self.store
    }

    pub async fn handle(&self, request: RecordedRequest) -> Outcome {
        if !self.mode.replays() {
            let fp = fingerprint(&request, &self.fingerprint);
            return self.forward_and_record(fp, request).await;
        }

        let (fp, result) = match_request(&request, &self.store, &self.fingerprint);
        match result {
            MatchResult::Hit(exchange) => {
                debug!(
                    "Replaying {}#{} for {} {}",
                    fp.short(),
                    exchange.sequence_index,
                    request.method,
                    request.target
                );
                Outcome::Replayed(exchange)
            }
            MatchResult::Miss if self.mode.forwards() => self.forward_and_record(fp, request).await,
            MatchResult::Miss => {
                debug!(
                    "No recording for {} {} ({})",
                    request.method,
                    request.target,
                    fp.short()
                );
                Outcome::NoRecording
            }
        }
    }

    /// Forward and record in a detached task, so a client that disconnects
    /// mid-request still leaves the exchange recorded.
    async fn forward_and_record(&self, fp: Fingerprint, request: RecordedRequest) -> Outcome {
        let forwarder = Arc::clone(&self.forwarder);
        let store = Arc::clone(&self.store);
        let mode = self.mode;

        let task = tokio::spawn(async move {
            let response = match forwarder.forward(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Forwarding {} {} failed ({}): {}",
                        request.method,
                        request.target,
                        e.kind(),
                        e
                    );
                    return Outcome::ForwardFailed(e);
                }
            };
            if let Some(latency_ms) = response.latency_ms {
                metrics::record_upstream_duration(&request.method, response.status, latency_ms);
            }

            let recorded = record(store, mode, fp, request, response.clone()).await;
            Outcome::Forwarded { response, recorded }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Forwarding task failed: {}", e);
                Outcome::ForwardFailed(ForwardError::UpstreamProtocolError(format!(
                    "forwarding task failed: {e}"
                )))
            }
        }
    }
}

/// Append the exchange off the async runtime. A failure is logged and counted
/// but never reaches the client.
async fn record(
    store: Arc<ExchangeStore>,
    mode: ProxyMode,
    fp: Fingerprint,
    request: RecordedRequest,
    response: RecordedResponse,
) -> Option<Arc<Exchange>> {
    let appended = tokio::task::spawn_blocking(move || {
        // In hybrid mode the live response already served this exchange.
        if mode == ProxyMode::Hybrid {
            store.append_consumed(fp, request, response)
        } else {
            store.append(fp, request, response)
        }
    })
    .await;

    match appended {
        Ok(Ok(exchange)) => {
            metrics::record_exchange_recorded();
            Some(exchange)
        }
        Ok(Err(e)) => {
            error!("Failed to persist recorded exchange: {}", e);
            metrics::record_persistence_error("append");
            None
        }
        Err(e) => {
            error!("Recording task failed: {}", e);
            metrics::record_persistence_error("append");
            None
        }
    }
}
