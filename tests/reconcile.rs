//! Reconciler integration: a live reconcile task converging an in-memory
//! kernel toward the store, and trigger coalescing under bursts.

mod common;

use async_trait::async_trait;
use common::{memory_repository, real_server, virtual_service};
use merlin::ipvs::{Ipvs, IpvsResult};
use merlin::ops::observability::ReconcileMetrics;
use merlin::reconciler::{IpvsReconciler, Reconciler};
use merlin::types::{
    RealServerConfig, RealServerKey, VirtualServiceConfig, VirtualServiceKey,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// In-memory kernel double. `list_delay` simulates a slow kernel so trigger
/// bursts land during an executing pass.
#[derive(Default)]
struct FakeKernel {
    services: Mutex<BTreeMap<VirtualServiceKey, VirtualServiceConfig>>,
    servers: Mutex<BTreeMap<VirtualServiceKey, BTreeMap<RealServerKey, RealServerConfig>>>,
    passes: Mutex<u64>,
    list_delay: Option<Duration>,
}

impl FakeKernel {
    fn slow(delay: Duration) -> Self {
        Self {
            list_delay: Some(delay),
            ..Default::default()
        }
    }

    fn pass_count(&self) -> u64 {
        *self.passes.lock()
    }

    fn service_count(&self) -> usize {
        self.services.lock().len()
    }

    fn server_count(&self, key: &VirtualServiceKey) -> usize {
        self.servers.lock().get(key).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Ipvs for FakeKernel {
    async fn list_services(&self) -> IpvsResult<Vec<(VirtualServiceKey, VirtualServiceConfig)>> {
        *self.passes.lock() += 1;
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .services
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_servers(
        &self,
        key: &VirtualServiceKey,
    ) -> IpvsResult<Vec<(RealServerKey, RealServerConfig)>> {
        Ok(self
            .servers
            .lock()
            .get(key)
            .map(|servers| servers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn add_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()> {
        self.services.lock().insert(key.clone(), config.clone());
        self.servers.lock().entry(key.clone()).or_default();
        Ok(())
    }

    async fn update_service(
        &self,
        key: &VirtualServiceKey,
        config: &VirtualServiceConfig,
    ) -> IpvsResult<()> {
        self.services.lock().insert(key.clone(), config.clone());
        Ok(())
    }

    async fn delete_service(&self, key: &VirtualServiceKey) -> IpvsResult<()> {
        self.services.lock().remove(key);
        self.servers.lock().remove(key);
        Ok(())
    }

    async fn add_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()> {
        self.servers
            .lock()
            .entry(service.clone())
            .or_default()
            .insert(key.clone(), config.clone());
        Ok(())
    }

    async fn update_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
        config: &RealServerConfig,
    ) -> IpvsResult<()> {
        self.add_server(service, key, config).await
    }

    async fn delete_server(
        &self,
        service: &VirtualServiceKey,
        key: &RealServerKey,
    ) -> IpvsResult<()> {
        if let Some(servers) = self.servers.lock().get_mut(service) {
            servers.remove(key);
        }
        Ok(())
    }

    async fn close(&self) {}
}

async fn settle<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn seeded_store_converges_then_tracks_deletions() {
    let repo = memory_repository();
    repo.create_service(&virtual_service("service1", "10.0.0.1"))
        .await
        .unwrap();
    repo.create_server(&real_server("service1", "172.16.1.1"))
        .await
        .unwrap();
    repo.create_server(&real_server("service1", "172.16.1.2"))
        .await
        .unwrap();

    let kernel = Arc::new(FakeKernel::default());
    let reconciler = IpvsReconciler::new(
        Duration::from_secs(3600),
        repo.clone(),
        Arc::clone(&kernel) as Arc<dyn Ipvs>,
        Arc::new(ReconcileMetrics::new()),
    );
    reconciler.start().await.unwrap();
    reconciler.sync();

    let key = virtual_service("service1", "10.0.0.1").key.unwrap();
    settle(|| kernel.service_count() == 1 && kernel.server_count(&key) == 2).await;

    // Drop one server from the store; the next pass removes exactly that
    // one from the kernel.
    repo.delete_server(
        "service1",
        &RealServerKey {
            ip: "172.16.1.1".to_string(),
            port: 9090,
        },
    )
    .await
    .unwrap();
    reconciler.sync();

    settle(|| kernel.server_count(&key) == 1).await;
    let remaining = kernel.list_servers(&key).await.unwrap();
    assert_eq!(remaining[0].0.ip, "172.16.1.2");
    assert_eq!(kernel.service_count(), 1);

    reconciler.stop().await;
}

#[tokio::test]
async fn trigger_burst_coalesces_into_one_follow_up_pass() {
    let repo = memory_repository();
    repo.create_service(&virtual_service("service1", "10.0.0.1"))
        .await
        .unwrap();

    let kernel = Arc::new(FakeKernel::slow(Duration::from_millis(100)));
    let reconciler = IpvsReconciler::new(
        Duration::from_secs(3600),
        repo.clone(),
        Arc::clone(&kernel) as Arc<dyn Ipvs>,
        Arc::new(ReconcileMetrics::new()),
    );
    reconciler.start().await.unwrap();

    // Wait for the initial pass to be in flight, then burst.
    settle(|| kernel.pass_count() >= 1).await;
    for _ in 0..10 {
        reconciler.sync();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let passes = kernel.pass_count();
    assert!(
        (1..=3).contains(&passes),
        "burst of 10 triggers ran {passes} passes, expected at most one follow-up"
    );

    reconciler.stop().await;
}

#[tokio::test]
async fn metrics_count_completed_passes() {
    let repo = memory_repository();
    let kernel = Arc::new(FakeKernel::default());
    let metrics = Arc::new(ReconcileMetrics::new());
    let reconciler = IpvsReconciler::new(
        Duration::from_secs(3600),
        repo,
        Arc::clone(&kernel) as Arc<dyn Ipvs>,
        Arc::clone(&metrics),
    );
    reconciler.start().await.unwrap();

    settle(|| metrics.pass_count() >= 1).await;
    assert_eq!(metrics.failure_count(), 0);

    reconciler.stop().await;
}
