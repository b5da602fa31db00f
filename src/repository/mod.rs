//! Storage-backed repository for virtual services and real servers.
//!
//! The repository is the only component that writes to the store. It
//! enforces the cross-record invariants the validator cannot express alone
//! (unique ids, parent existence, cascade delete) and classifies store
//! errors into domain errors.
//!
//! Key layout under the store prefix:
//!
//! ```text
//! services/{id}                       -> encoded VirtualService
//! services/{id}/servers/{ip}:{port}   -> encoded RealServer
//! ```
//!
//! Concurrency: no local locking. Creates are atomic through
//! `put_if_absent`; updates are read–merge–put and last-write-wins, which is
//! intentional for declarative state.

use crate::core::error::{Error, Result};
use crate::store::{Kv, StoreError};
use crate::types::{merge, validate, RealServer, RealServerKey, VirtualService};
use prost::Message;
use std::sync::Arc;

#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn Kv>,
}

impl Repository {
    pub fn new(store: Arc<dyn Kv>) -> Self {
        Self { store }
    }

    /// Create a virtual service. `AlreadyExists` if the id is taken.
    pub async fn create_service(&self, service: &VirtualService) -> Result<()> {
        validate::validate_service_create(service)?;
        let key = service_key(&service.id);
        match self.store.put_if_absent(&key, service.encode_to_vec()).await {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists) => Err(Error::already_exists(format!(
                "service {:?}",
                service.id
            ))),
            Err(e) => Err(classify(e)),
        }
    }

    /// Apply a partial update to an existing service. `NotFound` if absent.
    pub async fn update_service(&self, patch: &VirtualService) -> Result<()> {
        validate::validate_service_update(patch)?;
        let key = service_key(&patch.id);
        let current = self
            .read_service(&key)
            .await?
            .ok_or_else(|| Error::not_found(format!("service {:?}", patch.id)))?;

        let merged = merge::merge_service(&current, patch);
        self.store
            .put(&key, merged.encode_to_vec())
            .await
            .map_err(classify)
    }

    /// Delete a service and, by cascade, all of its servers. Idempotent.
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::invalid_argument("service id required"));
        }
        // Children first under `{id}/`, then the record itself; a bare
        // prefix delete on `services/{id}` would also hit `services/{id}x`.
        self.store
            .delete_prefix(&format!("{}/", service_key(id)))
            .await
            .map_err(classify)?;
        self.store.delete(&service_key(id)).await.map_err(classify)
    }

    /// Fetch a single service by id.
    pub async fn get_service(&self, id: &str) -> Result<Option<VirtualService>> {
        if id.is_empty() {
            return Err(Error::invalid_argument("service id required"));
        }
        self.read_service(&service_key(id)).await
    }

    /// List all services, ordered by id.
    pub async fn list_services(&self) -> Result<Vec<VirtualService>> {
        let entries = self.store.list("services/").await.map_err(classify)?;
        entries
            .into_iter()
            // Child keys carry further path segments; service records don't.
            .filter(|(key, _)| !key.trim_start_matches("services/").contains('/'))
            .map(|(key, bytes)| decode::<VirtualService>(&key, &bytes))
            .collect()
    }

    /// Create a real server under an existing service.
    pub async fn create_server(&self, server: &RealServer) -> Result<()> {
        validate::validate_server_create(server)?;
        let Some(key) = server.key.as_ref() else {
            return Err(Error::invalid_argument("server key required"));
        };
        self.require_parent(&server.service_id).await?;

        let store_key = server_key(&server.service_id, key);
        match self
            .store
            .put_if_absent(&store_key, server.encode_to_vec())
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists) => Err(Error::already_exists(format!(
                "server {} of service {:?}",
                key, server.service_id
            ))),
            Err(e) => Err(classify(e)),
        }
    }

    /// Apply a partial update to an existing server. `NotFound` if the
    /// parent service or the server itself is missing.
    pub async fn update_server(&self, patch: &RealServer) -> Result<()> {
        validate::validate_server_update(patch)?;
        let Some(key) = patch.key.as_ref() else {
            return Err(Error::invalid_argument("server key required"));
        };
        self.require_parent(&patch.service_id).await?;

        let store_key = server_key(&patch.service_id, key);
        let bytes = self.store.get(&store_key).await.map_err(classify)?;
        let current = match bytes {
            Some(bytes) => decode::<RealServer>(&store_key, &bytes)?,
            None => {
                return Err(Error::not_found(format!(
                    "server {} of service {:?}",
                    key, patch.service_id
                )))
            }
        };

        let merged = merge::merge_server(&current, patch);
        self.store
            .put(&store_key, merged.encode_to_vec())
            .await
            .map_err(classify)
    }

    /// Delete a server. Idempotent.
    pub async fn delete_server(&self, service_id: &str, key: &RealServerKey) -> Result<()> {
        if service_id.is_empty() {
            return Err(Error::invalid_argument("service id required"));
        }
        self.store
            .delete(&server_key(service_id, key))
            .await
            .map_err(classify)
    }

    /// List the servers of a service, ordered by `{ip}:{port}` key.
    pub async fn list_servers(&self, service_id: &str) -> Result<Vec<RealServer>> {
        if service_id.is_empty() {
            return Err(Error::invalid_argument("service id required"));
        }
        let prefix = format!("{}/servers/", service_key(service_id));
        let entries = self.store.list(&prefix).await.map_err(classify)?;
        entries
            .into_iter()
            .map(|(key, bytes)| decode::<RealServer>(&key, &bytes))
            .collect()
    }

    async fn read_service(&self, key: &str) -> Result<Option<VirtualService>> {
        match self.store.get(key).await.map_err(classify)? {
            Some(bytes) => Ok(Some(decode::<VirtualService>(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn require_parent(&self, service_id: &str) -> Result<()> {
        match self.read_service(&service_key(service_id)).await? {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("service {service_id:?}"))),
        }
    }
}

fn service_key(id: &str) -> String {
    format!("services/{id}")
}

fn server_key(service_id: &str, key: &RealServerKey) -> String {
    format!("services/{service_id}/servers/{}:{}", key.ip, key.port)
}

fn decode<M: Message + Default>(key: &str, bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| Error::internal(format!("decoding record at {key:?}: {e}")))
}

/// Classify a store failure into a domain error.
fn classify(err: StoreError) -> Error {
    match err {
        StoreError::AlreadyExists => Error::already_exists("key"),
        StoreError::Unavailable(message) => Error::unavailable(message),
        StoreError::Conflict(message) => Error::unavailable(message),
        StoreError::Internal(message) => Error::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::{
        ForwardMethod, Protocol, RealServerConfig, UInt32Value, VirtualServiceConfig,
        VirtualServiceKey,
    };

    fn repository() -> Repository {
        Repository::new(Arc::new(MemoryStore::new()))
    }

    fn service(id: &str) -> VirtualService {
        VirtualService {
            id: id.to_string(),
            key: Some(VirtualServiceKey {
                ip: "127.0.0.1".to_string(),
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

    fn server(service_id: &str, ip: &str) -> RealServer {
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

    #[tokio::test]
    async fn created_service_reads_back_equal() {
        let repo = repository();
        let svc = service("service1");
        repo.create_service(&svc).await.unwrap();
        assert_eq!(repo.get_service("service1").await.unwrap(), Some(svc));
    }

    #[tokio::test]
    async fn duplicate_create_yields_already_exists() {
        let repo = repository();
        repo.create_service(&service("service1")).await.unwrap();

        let mut other = service("service1");
        other.key.as_mut().unwrap().ip = "127.0.0.2".to_string();
        other.config.as_mut().unwrap().scheduler = "wrr".to_string();
        match repo.create_service(&other).await {
            Err(Error::AlreadyExists { .. }) => {}
            other => panic!("expected AlreadyExists, got {other:?}"),
        }

        // The original record is untouched.
        let stored = repo.get_service("service1").await.unwrap().unwrap();
        assert_eq!(stored.config.unwrap().scheduler, "sh");
    }

    #[tokio::test]
    async fn update_missing_service_yields_not_found() {
        let repo = repository();
        match repo.update_service(&service("service1")).await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_overlays_patch_preserving_unset_fields() {
        let repo = repository();
        let mut svc = service("service1");
        svc.config.as_mut().unwrap().persistence_timeout = Some(UInt32Value::new(300));
        repo.create_service(&svc).await.unwrap();

        let patch = VirtualService {
            id: "service1".to_string(),
            config: Some(VirtualServiceConfig {
                scheduler: "wrr".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        repo.update_service(&patch).await.unwrap();

        let stored = repo.get_service("service1").await.unwrap().unwrap();
        let config = stored.config.unwrap();
        assert_eq!(config.scheduler, "wrr");
        assert_eq!(config.persistence_timeout(), Some(300));
        assert_eq!(stored.key, svc.key);
    }

    #[tokio::test]
    async fn delete_service_cascades_to_servers() {
        let repo = repository();
        repo.create_service(&service("service1")).await.unwrap();
        repo.create_server(&server("service1", "172.16.1.1")).await.unwrap();
        repo.create_server(&server("service1", "172.16.1.2")).await.unwrap();

        repo.delete_service("service1").await.unwrap();
        assert_eq!(repo.get_service("service1").await.unwrap(), None);
        assert!(repo.list_servers("service1").await.unwrap().is_empty());

        // Idempotent.
        repo.delete_service("service1").await.unwrap();
    }

    #[tokio::test]
    async fn delete_does_not_clip_sibling_ids_sharing_a_prefix() {
        let repo = repository();
        repo.create_service(&service("svc")).await.unwrap();
        repo.create_service(&service("svc2")).await.unwrap();

        repo.delete_service("svc").await.unwrap();
        assert!(repo.get_service("svc2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_server_requires_parent() {
        let repo = repository();
        match repo.create_server(&server("service-does-not-exist", "172.16.1.1")).await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_server_yields_already_exists() {
        let repo = repository();
        repo.create_service(&service("service1")).await.unwrap();
        repo.create_server(&server("service1", "172.16.1.1")).await.unwrap();

        let mut second = server("service1", "172.16.1.1");
        second.config = Some(RealServerConfig {
            weight: Some(UInt32Value::new(1)),
            forward: ForwardMethod::Tunnel as i32,
        });
        match repo.create_server(&second).await {
            Err(Error::AlreadyExists { .. }) => {}
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_server_merges_within_parent() {
        let repo = repository();
        repo.create_service(&service("service1")).await.unwrap();
        repo.create_server(&server("service1", "172.16.1.1")).await.unwrap();

        let patch = RealServer {
            service_id: "service1".to_string(),
            key: Some(RealServerKey {
                ip: "172.16.1.1".to_string(),
                port: 9090,
            }),
            config: Some(RealServerConfig {
                weight: Some(UInt32Value::new(0)),
                forward: ForwardMethod::Unset as i32,
            }),
        };
        repo.update_server(&patch).await.unwrap();

        let servers = repo.list_servers("service1").await.unwrap();
        let config = servers[0].config.clone().unwrap();
        assert_eq!(config.weight(), Some(0));
        assert_eq!(config.forward, ForwardMethod::Route as i32);
    }

    #[tokio::test]
    async fn update_missing_server_yields_not_found() {
        let repo = repository();
        repo.create_service(&service("service1")).await.unwrap();
        match repo.update_server(&server("service1", "172.16.1.1")).await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listings_are_key_ordered_and_scoped() {
        let repo = repository();
        repo.create_service(&service("b")).await.unwrap();
        repo.create_service(&service("a")).await.unwrap();
        repo.create_server(&server("a", "10.0.0.2")).await.unwrap();
        repo.create_server(&server("a", "10.0.0.1")).await.unwrap();

        let ids: Vec<String> = repo
            .list_services()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let ips: Vec<String> = repo
            .list_servers("a")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.key.unwrap().ip)
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);

        assert!(repo.list_servers("b").await.unwrap().is_empty());
    }
}
