//! Daemon runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store → kernel adapter + reconciler → initial sync →
//!   store subscription dispatcher → gRPC listener → health listener
//! - Shutdown order: subscription → reconciler (grace period) → kernel
//!   adapter → gRPC (drains in-flight RPCs) → health listener
//!
//! Any start failure is fatal and bubbles out of `run`, so the process
//! exits non-zero when it cannot listen, reach the store, or open the
//! kernel interface.

use crate::core::config::{Config, BACKEND_ETCD3};
use crate::ipvs::{netlink::NetlinkIpvs, Ipvs};
use crate::ops::observability::{HealthServer, ReconcileMetrics};
use crate::reconciler::{IpvsReconciler, Reconciler, StubReconciler};
use crate::repository::Repository;
use crate::server::{grpc::MerlinServer, MerlinService};
use crate::store::{etcd2::Etcd2Store, etcd3::Etcd3Store, Kv};
use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

pub struct Runtime {
    config: Arc<Config>,
    reconciler: Option<Arc<dyn Reconciler>>,
    ipvs: Option<Arc<dyn Ipvs>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher_handle: Option<JoinHandle<()>>,
    grpc_handle: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    health_handle: Option<JoinHandle<Result<()>>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            reconciler: None,
            ipvs: None,
            shutdown_tx,
            shutdown_rx,
            dispatcher_handle: None,
            grpc_handle: None,
            health_handle: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize and start all components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            backend = %self.config.store_backend,
            prefix = %self.config.store_prefix,
            "starting merlin"
        );

        let store = self.connect_store().await?;
        let repository = Repository::new(Arc::clone(&store));

        let mut registry = Registry::default();
        let metrics = Arc::new(ReconcileMetrics::new());
        metrics.register(&mut registry);

        // Kernel adapter and reconciler. In read-only mode the stub keeps
        // the facade operational without a netlink socket.
        let reconciler: Arc<dyn Reconciler> = if self.config.reconcile {
            let ipvs: Arc<dyn Ipvs> =
                Arc::new(NetlinkIpvs::open().context("unable to open kernel IPVS interface")?);
            self.ipvs = Some(Arc::clone(&ipvs));
            Arc::new(IpvsReconciler::new(
                self.config.sync_period(),
                repository.clone(),
                ipvs,
                Arc::clone(&metrics),
            ))
        } else {
            Arc::new(StubReconciler::new())
        };

        reconciler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("unable to start reconciler: {e}"))?;
        reconciler.sync();
        self.reconciler = Some(Arc::clone(&reconciler));

        // Store subscription: one dispatcher task forwards change signals,
        // so notifications are handled strictly one at a time.
        let mut changes = store.subscribe(self.shutdown_rx.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();
        self.dispatcher_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Some(()) => {
                            tracing::info!("store updated, starting sync");
                            reconciler.sync();
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        self.start_grpc(repository).await?;
        self.start_health(Arc::new(registry)).await?;

        tracing::info!(port = self.config.port, "merlin started");
        Ok(())
    }

    async fn connect_store(&self) -> Result<Arc<dyn Kv>> {
        let endpoints = &self.config.store_endpoints;
        let prefix = &self.config.store_prefix;
        let store: Arc<dyn Kv> = if self.config.store_backend == BACKEND_ETCD3 {
            Arc::new(
                Etcd3Store::connect(endpoints, prefix)
                    .await
                    .context("unable to connect etcd3 store")?,
            )
        } else {
            Arc::new(
                Etcd2Store::connect(endpoints, prefix)
                    .await
                    .context("unable to connect etcd2 store")?,
            )
        };
        Ok(store)
    }

    async fn start_grpc(&mut self, repository: Repository) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("unable to listen on {addr}"))?;
        let incoming = TcpListenerStream::new(listener);

        let service = MerlinServer::new(MerlinService::new(repository));
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.grpc_handle = Some(tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::info!("grpc server shutting down");
                })
                .await
        }));
        tracing::info!(%addr, "grpc listener started");
        Ok(())
    }

    async fn start_health(&mut self, registry: Arc<Registry>) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.health_port).into();
        let server = HealthServer::bind(addr, registry, self.shutdown_rx.clone()).await?;
        self.health_handle = Some(tokio::spawn(server.run()));
        Ok(())
    }

    /// Run until SIGINT/SIGTERM or component-requested shutdown, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, shutting down");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all components in reverse order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping merlin");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.await;
        }

        if let Some(reconciler) = self.reconciler.take() {
            reconciler.stop().await;
        }

        if let Some(ipvs) = self.ipvs.take() {
            ipvs.close().await;
        }

        if let Some(handle) = self.grpc_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "grpc server stopped with error"),
                Err(e) => tracing::warn!(error = %e, "grpc server task panicked"),
            }
        }

        if let Some(handle) = self.health_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "health listener stopped with error"),
                Err(e) => tracing::warn!(error = %e, "health listener task panicked"),
            }
        }

        tracing::info!("merlin stopped");
        Ok(())
    }
}
