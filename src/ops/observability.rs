//! Health endpoints and metrics.
//!
//! A small HTTP listener on the health port serves `/health` and `/alive`
//! (both plain `ok`) plus `/metrics` in Prometheus text format. The only
//! instrumented component is the reconciler: completed and aborted pass
//! counters.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Reconciler pass counters.
#[derive(Default)]
pub struct ReconcileMetrics {
    passes: Counter,
    failures: Counter,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the counters under the `merlin_` namespace.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "merlin_reconcile_passes",
            "Completed reconcile passes",
            self.passes.clone(),
        );
        registry.register(
            "merlin_reconcile_failures",
            "Reconcile passes aborted before applying",
            self.failures.clone(),
        );
    }

    pub fn record_pass(&self) {
        self.passes.inc();
    }

    pub fn record_failure(&self) {
        self.failures.inc();
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.get()
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.get()
    }
}

/// HTTP listener for `/health`, `/alive` and `/metrics`.
pub struct HealthServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthServer {
    /// Bind the health port. Binding happens here so a conflict is a fatal
    /// startup error rather than a background surprise.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health port {addr}"))?;
        Ok(Self {
            listener,
            registry,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "health listener started");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted.context("accepting health connection")?;
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let registry = Arc::clone(&registry);
                            async move { handle(req.uri().path(), &registry) }
                        });
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::debug!(error = %e, "health connection error");
                        }
                    });
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!("health listener stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle(
    path: &str,
    registry: &Registry,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match path {
        "/health" | "/alive" => text_response(StatusCode::OK, "ok\n".to_string()),
        "/metrics" => {
            let mut body = String::new();
            match encode(&mut body, registry) {
                Ok(()) => text_response(StatusCode::OK, body),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("encoding metrics: {e}\n"),
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found\n".to_string()),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}
