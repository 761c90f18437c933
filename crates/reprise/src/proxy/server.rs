//! ProxyServer struct and main run loop.
//!
//! Startup is split in two steps so callers (and tests) can learn the bound
//! address before serving: [`ProxyServer::bind`] claims the sockets, then
//! [`BoundProxy::run_until`] serves until the shutdown future resolves.

use super::controller::ProxyController;
use super::forwarding::{Forwarder, HttpForwarder};
use super::handler::RequestHandler;
use super::network::create_listener;
use crate::config::Config;
use crate::error::StartupError;
use crate::metrics;
use crate::recording::ExchangeStore;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How long in-flight requests get to finish after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The main proxy server struct.
pub struct ProxyServer {
    config: Arc<Config>,
    store: Arc<ExchangeStore>,
    handler: RequestHandler,
}

impl ProxyServer {
    /// Build the server from configuration: open the recording log and set up
    /// the upstream client.
    pub fn new(config: Config) -> Result<Self, StartupError> {
        config.validate()?;
        let forwarder = HttpForwarder::from_config(&config)?;
        let store = ExchangeStore::open(&config.recording, &config.fingerprint)?;
        Ok(Self::from_parts(config, Arc::new(store), Arc::new(forwarder)))
    }

    /// Assemble a server from an existing store and forwarder.
    pub fn from_parts(
        config: Config,
        store: Arc<ExchangeStore>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        let controller = ProxyController::new(
            config.recording.mode,
            Arc::clone(&store),
            forwarder,
            config.fingerprint.clone(),
        );
        let handler = RequestHandler::new(controller, &config.recording);
        Self {
            config: Arc::new(config),
            store,
            handler,
        }
    }

    pub fn store(&self) -> &Arc<ExchangeStore> {
        &self.store
    }

    /// Bind the proxy listener and, when enabled, the metrics listener.
    pub async fn bind(self) -> Result<BoundProxy, StartupError> {
        let addr = self.config.listen.socket_addr()?;
        let listener =
            create_listener(addr).map_err(|source| StartupError::Bind { addr, source })?;

        let metrics_listener = if self.config.metrics.enabled {
            let metrics_addr = SocketAddr::new(addr.ip(), self.config.metrics.port);
            let listener = create_listener(metrics_addr).map_err(|source| StartupError::Bind {
                addr: metrics_addr,
                source,
            })?;
            Some(listener)
        } else {
            None
        };

        Ok(BoundProxy {
            listener,
            metrics_listener,
            config: self.config,
            store: self.store,
            handler: self.handler,
        })
    }

    /// Bind and serve until Ctrl-C.
    pub async fn run(self) -> Result<(), StartupError> {
        let bound = self.bind().await?;
        bound.run_until(shutdown_signal()).await
    }
}

/// A proxy whose sockets are bound but not yet serving.
pub struct BoundProxy {
    listener: TcpListener,
    metrics_listener: Option<TcpListener>,
    config: Arc<Config>,
    store: Arc<ExchangeStore>,
    handler: RequestHandler,
}

impl BoundProxy {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Accept connections until `shutdown` resolves, then drain in-flight
    /// requests and optionally snapshot the recording log.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), StartupError>
    where
        F: Future<Output = ()>,
    {
        let BoundProxy {
            listener,
            metrics_listener,
            config,
            store,
            handler,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("Listening on http://{}", addr);
        }
        info!("Proxying to {}", config.upstream.url);
        info!(
            "Mode: {} (consumption={}, exhaustion={}, recordings={})",
            config.recording.mode.as_str(),
            config.recording.consumption.as_str(),
            config.recording.exhaustion.as_str(),
            store.location()
        );

        let metrics_task = metrics_listener.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                info!("Metrics available at http://{}/metrics", addr);
            }
            tokio::spawn(metrics::serve(listener))
        });

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { handler.handle(req).await }
                    });
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            debug!("Error serving HTTP connection from {}: {}", remote_addr, err);
                        }
                    });
                }
                () = &mut shutdown => {
                    info!("Shutdown requested, draining connections");
                    break;
                }
            }
        }

        drop(listener);
        if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown())
            .await
            .is_err()
        {
            warn!(
                "Connections still open after {:?}, closing anyway",
                DRAIN_TIMEOUT
            );
        }
        if let Some(task) = metrics_task {
            task.abort();
        }

        if config.recording.snapshot_on_shutdown {
            snapshot(store).await;
        }
        info!("Shutdown complete");
        Ok(())
    }
}

/// Compact the log. Failure is logged; every exchange is already in the log.
async fn snapshot(store: Arc<ExchangeStore>) {
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(count)) => info!("Snapshot written with {} exchanges", count),
        Ok(Err(e)) => {
            error!("Snapshot failed: {}", e);
            metrics::record_persistence_error("snapshot");
        }
        Err(e) => {
            error!("Snapshot task failed: {}", e);
            metrics::record_persistence_error("snapshot");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
