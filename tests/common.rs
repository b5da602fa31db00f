//! Common test utilities.
//!
//! Shared record builders for integration tests. Import with `mod common;`.

use merlin::repository::Repository;
use merlin::store::memory::MemoryStore;
use merlin::types::{
    ForwardMethod, Protocol, RealServer, RealServerConfig, RealServerKey, UInt32Value,
    VirtualService, VirtualServiceConfig, VirtualServiceKey,
};
use std::sync::Arc;

/// Repository over a fresh in-memory store.
pub fn memory_repository() -> Repository {
    Repository::new(Arc::new(MemoryStore::new()))
}

/// A valid virtual service named `id` at `ip:8080/tcp` with the `sh`
/// scheduler.
pub fn virtual_service(id: &str, ip: &str) -> VirtualService {
    VirtualService {
        id: id.to_string(),
        key: Some(VirtualServiceKey {
            ip: ip.to_string(),
            port: 8080,
            protocol: Protocol::Tcp as i32,
        }),
        config: Some(VirtualServiceConfig {
            scheduler: "sh".to_string(),
            flags: vec![],
            persistence_timeout: None,
        }),
        health_check: None,
    }
}

/// A valid real server under `service_id` at `ip:9090`, weight 2, direct
/// routing.
pub fn real_server(service_id: &str, ip: &str) -> RealServer {
    RealServer {
        service_id: service_id.to_string(),
        key: Some(RealServerKey {
            ip: ip.to_string(),
            port: 9090,
        }),
        config: Some(RealServerConfig {
            weight: Some(UInt32Value::new(2)),
            forward: ForwardMethod::Route as i32,
        }),
    }
}
