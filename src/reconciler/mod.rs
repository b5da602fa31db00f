//! Reconciliation of kernel IPVS state toward stored state.
//!
//! A dedicated task drives the kernel through the [`Ipvs`][crate::ipvs::Ipvs]
//! adapter. Three triggers start a pass: a periodic tick, an explicit
//! [`Reconciler::sync`] call, and a store-change notification (the runtime
//! forwards those as `sync()` calls). Triggers arriving while a pass is
//! executing coalesce into a single pending permit, so churn produces at
//! most one follow-up pass.
//!
//! A pass snapshots both sides, diffs services by `(ip, port, protocol)` and
//! servers by `(ip, port)` within matched parents, then applies mutations in
//! an order that never orphans a server and always creates a parent before
//! its backends. Per-entry kernel failures are logged and skipped; a failed
//! snapshot aborts the pass and the next trigger retries. The periodic tick
//! bounds retry frequency, so there is no backoff logic.

use crate::core::error::{Error, Result};
use crate::ipvs::{flags_to_bits, Ipvs};
use crate::ops::observability::ReconcileMetrics;
use crate::repository::Repository;
use crate::types::{
    RealServerConfig, RealServerKey, VirtualServiceConfig, VirtualServiceKey,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How long `stop` waits for an in-flight pass.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Reconciler lifecycle. Triggers are accepted only in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Drives local kernel IPVS state toward the persisted desired state.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Start the reconcile task. Fails if already started.
    async fn start(&self) -> Result<()>;

    /// Stop the task, waiting for the current pass up to a grace period.
    async fn stop(&self);

    /// Request a pass. Non-blocking; ignored unless running.
    fn sync(&self);
}

/// The real reconciler.
pub struct IpvsReconciler {
    period: Duration,
    repository: Repository,
    ipvs: Arc<dyn Ipvs>,
    metrics: Arc<ReconcileMetrics>,
    state: Mutex<State>,
    trigger: Arc<Notify>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IpvsReconciler {
    pub fn new(
        period: Duration,
        repository: Repository,
        ipvs: Arc<dyn Ipvs>,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        Self {
            period,
            repository,
            ipvs,
            metrics,
            state: Mutex::new(State::Stopped),
            trigger: Arc::new(Notify::new()),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Reconciler for IpvsReconciler {
    async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != State::Stopped {
                return Err(Error::internal(format!(
                    "reconciler cannot start from {state:?}"
                )));
            }
            *state = State::Starting;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = SyncTask {
            period: self.period,
            repository: self.repository.clone(),
            ipvs: Arc::clone(&self.ipvs),
            metrics: Arc::clone(&self.metrics),
            trigger: Arc::clone(&self.trigger),
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.task.lock() = Some(handle);
        *self.state.lock() = State::Running;
        tracing::info!(period = ?self.period, "reconciler started");
        Ok(())
    }

    async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != State::Running {
                return;
            }
            *state = State::Stopping;
        }

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                tracing::warn!("reconciler pass still running after grace period, detaching");
            }
        }

        *self.state.lock() = State::Stopped;
        tracing::info!("reconciler stopped");
    }

    fn sync(&self) {
        if *self.state.lock() == State::Running {
            self.trigger.notify_one();
        }
    }
}

struct SyncTask {
    period: Duration,
    repository: Repository,
    ipvs: Arc<dyn Ipvs>,
    metrics: Arc<ReconcileMetrics>,
    trigger: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncTask {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.trigger.notified() => {}
                _ = self.shutdown_rx.changed() => {}
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            match run_pass(&self.repository, self.ipvs.as_ref()).await {
                Ok(stats) => {
                    self.metrics.record_pass();
                    if stats.total() > 0 {
                        tracing::info!(
                            added_services = stats.added_services,
                            updated_services = stats.updated_services,
                            deleted_services = stats.deleted_services,
                            added_servers = stats.added_servers,
                            updated_servers = stats.updated_servers,
                            deleted_servers = stats.deleted_servers,
                            "reconcile pass applied changes"
                        );
                    } else {
                        tracing::debug!("reconcile pass found kernel in sync");
                    }
                }
                Err(e) => {
                    self.metrics.record_failure();
                    tracing::warn!(error = %e, "reconcile pass aborted, awaiting next trigger");
                }
            }
        }
    }
}

/// Mutations applied by one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub added_services: u64,
    pub updated_services: u64,
    pub deleted_services: u64,
    pub added_servers: u64,
    pub updated_servers: u64,
    pub deleted_servers: u64,
}

impl PassStats {
    pub fn total(&self) -> u64 {
        self.added_services
            + self.updated_services
            + self.deleted_services
            + self.added_servers
            + self.updated_servers
            + self.deleted_servers
    }
}

/// One complete reconcile pass: snapshot, diff, apply.
///
/// Aborts with an error only when a snapshot cannot be taken; individual
/// mutation failures are logged and skipped so one bad entry cannot block
/// the rest.
pub async fn run_pass(repository: &Repository, ipvs: &dyn Ipvs) -> Result<PassStats> {
    // Desired state snapshot. The kernel does not store the service id, so
    // everything downstream is keyed by the (ip, port, protocol) triple.
    let mut desired_services: BTreeMap<VirtualServiceKey, VirtualServiceConfig> = BTreeMap::new();
    let mut desired_servers: BTreeMap<VirtualServiceKey, BTreeMap<RealServerKey, RealServerConfig>> =
        BTreeMap::new();

    for service in repository.list_services().await? {
        let (Some(key), Some(config)) = (service.key.clone(), service.config.clone()) else {
            tracing::warn!(id = %service.id, "skipping stored service without key or config");
            continue;
        };

        let mut servers = BTreeMap::new();
        for server in repository.list_servers(&service.id).await? {
            let (Some(server_key), Some(server_config)) = (server.key, server.config) else {
                tracing::warn!(id = %service.id, "skipping stored server without key or config");
                continue;
            };
            servers.insert(server_key, server_config);
        }

        desired_servers.insert(key.clone(), servers);
        desired_services.insert(key, config);
    }

    // Kernel state snapshot.
    let actual_services: BTreeMap<VirtualServiceKey, VirtualServiceConfig> = ipvs
        .list_services()
        .await
        .map_err(|e| Error::internal(format!("listing kernel services: {e}")))?
        .into_iter()
        .collect();

    let mut actual_servers: BTreeMap<VirtualServiceKey, BTreeMap<RealServerKey, RealServerConfig>> =
        BTreeMap::new();
    for key in actual_services.keys() {
        let servers = ipvs
            .list_servers(key)
            .await
            .map_err(|e| Error::internal(format!("listing kernel servers of {key}: {e}")))?;
        actual_servers.insert(key.clone(), servers.into_iter().collect());
    }

    let mut stats = PassStats::default();

    // Extra servers of surviving services go first so no mutation below can
    // observe a server whose parent is about to change under it.
    for (service_key, servers) in &actual_servers {
        let Some(wanted) = desired_servers.get(service_key) else {
            continue; // whole service is deleted below
        };
        for server_key in servers.keys() {
            if !wanted.contains_key(server_key) {
                tracing::info!(service = %service_key, server = %server_key, "deleting kernel server");
                if let Err(e) = ipvs.delete_server(service_key, server_key).await {
                    tracing::warn!(service = %service_key, server = %server_key, error = %e,
                        "failed to delete kernel server");
                } else {
                    stats.deleted_servers += 1;
                }
            }
        }
    }

    // Services present in the kernel but not in the store.
    for service_key in actual_services.keys() {
        if !desired_services.contains_key(service_key) {
            tracing::info!(service = %service_key, "deleting kernel service");
            if let Err(e) = ipvs.delete_service(service_key).await {
                tracing::warn!(service = %service_key, error = %e, "failed to delete kernel service");
            } else {
                stats.deleted_services += 1;
            }
        }
    }

    // Services present in the store but not in the kernel.
    for (service_key, config) in &desired_services {
        if !actual_services.contains_key(service_key) {
            tracing::info!(service = %service_key, "adding kernel service");
            if let Err(e) = ipvs.add_service(service_key, config).await {
                tracing::warn!(service = %service_key, error = %e, "failed to add kernel service");
            } else {
                stats.added_services += 1;
            }
        }
    }

    // Config drift on services present in both.
    for (service_key, config) in &desired_services {
        if let Some(actual) = actual_services.get(service_key) {
            if !service_config_equal(config, actual) {
                tracing::info!(service = %service_key, "updating kernel service");
                if let Err(e) = ipvs.update_service(service_key, config).await {
                    tracing::warn!(service = %service_key, error = %e, "failed to update kernel service");
                } else {
                    stats.updated_services += 1;
                }
            }
        }
    }

    // Server adds next: every parent now exists in the kernel.
    for (service_key, wanted) in &desired_servers {
        let present = actual_servers.get(service_key);
        for (server_key, config) in wanted {
            if present.and_then(|servers| servers.get(server_key)).is_none() {
                tracing::info!(service = %service_key, server = %server_key, "adding kernel server");
                if let Err(e) = ipvs.add_server(service_key, server_key, config).await {
                    tracing::warn!(service = %service_key, server = %server_key, error = %e,
                        "failed to add kernel server");
                } else {
                    stats.added_servers += 1;
                }
            }
        }
    }

    // Server config drift last.
    for (service_key, wanted) in &desired_servers {
        let Some(present) = actual_servers.get(service_key) else {
            continue;
        };
        for (server_key, config) in wanted {
            if let Some(actual) = present.get(server_key) {
                if !server_config_equal(config, actual) {
                    tracing::info!(service = %service_key, server = %server_key, "updating kernel server");
                    if let Err(e) = ipvs.update_server(service_key, server_key, config).await {
                        tracing::warn!(service = %service_key, server = %server_key, error = %e,
                            "failed to update kernel server");
                    } else {
                        stats.updated_servers += 1;
                    }
                }
            }
        }
    }

    Ok(stats)
}

/// Config equality after normalization: flags compare as kernel bits where
/// possible (so aliases collapse) and an absent persistence timeout equals
/// the kernel default of 0.
fn service_config_equal(desired: &VirtualServiceConfig, actual: &VirtualServiceConfig) -> bool {
    let flags_equal = match (flags_to_bits(&desired.flags), flags_to_bits(&actual.flags)) {
        (Ok(a), Ok(b)) => a == b,
        _ => {
            desired.flags.iter().collect::<BTreeSet<_>>()
                == actual.flags.iter().collect::<BTreeSet<_>>()
        }
    };
    desired.scheduler == actual.scheduler
        && flags_equal
        && desired.persistence_timeout().unwrap_or(0) == actual.persistence_timeout().unwrap_or(0)
}

fn server_config_equal(desired: &RealServerConfig, actual: &RealServerConfig) -> bool {
    desired.weight().unwrap_or(0) == actual.weight().unwrap_or(0)
        && desired.forward == actual.forward
}

/// No-op reconciler for read-only deployments and tests; satisfies the
/// interface so the facade can operate without touching the kernel.
#[derive(Default)]
pub struct StubReconciler;

impl StubReconciler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reconciler for StubReconciler {
    async fn start(&self) -> Result<()> {
        tracing::info!("reconciliation disabled, using stub reconciler");
        Ok(())
    }

    async fn stop(&self) {}

    fn sync(&self) {
        tracing::debug!("stub reconciler ignoring sync request");
    }
}
