//! etcd v2 store backend.
//!
//! Speaks the v2 keys HTTP API. Two accommodations for the v2 storage
//! model, both invisible above the [`Kv`] trait:
//!
//! - v2 values are JSON strings, so encoded records are wrapped in
//!   URL-safe base64.
//! - a v2 key cannot be both a value and a directory, so the record at
//!   `services/{id}` is stored at the `services/{id}/_info` node and
//!   translated back on read.
//!
//! Subscription is a `?wait=true&recursive=true` long poll tracking
//! `modifiedIndex`.

use crate::store::{signal_change, Kv, StoreError, StoreResult};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Node name holding the record of a key that also has children.
const INFO_NODE: &str = "_info";

/// v2 error code for "key already exists" (prevExist=false failed).
const CODE_NODE_EXIST: i64 = 105;
/// v2 error code for "the event in requested index is outdated and cleared".
const CODE_EVENT_INDEX_CLEARED: i64 = 401;

pub struct Etcd2Store {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoints: Vec<String>,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Option<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode")]
    error_code: i64,
    #[serde(default)]
    message: String,
}

impl Etcd2Store {
    pub async fn connect(endpoints: &[String], prefix: &str) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Internal("no store endpoints given".to_string()));
        }
        let store = Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoints: endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            prefix: prefix.trim_end_matches('/').to_string(),
        };
        // Probe the prefix so a dead cluster fails startup instead of the
        // first RPC.
        store.request(Method::GET, &store.path(""), None).await?;
        Ok(store)
    }

    fn path(&self, key: &str) -> String {
        if key.is_empty() {
            format!("/v2/keys{}", self.prefix)
        } else {
            format!("/v2/keys{}/{}", self.prefix, key.trim_end_matches('/'))
        }
    }

    /// Path of the node actually holding a record: `services/{id}` lives at
    /// `services/{id}/_info`, server records at their own key.
    fn record_path(&self, key: &str) -> String {
        if key.contains("/servers/") {
            self.path(key)
        } else {
            format!("{}/{}", self.path(key), INFO_NODE)
        }
    }

    /// Issue a request, trying each endpoint in order on transport failure.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<String>,
    ) -> StoreResult<(StatusCode, Bytes)> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let uri = format!("{endpoint}{path_and_query}");
            let mut builder = Request::builder().method(method.clone()).uri(&uri);
            if body.is_some() {
                builder = builder.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.clone().unwrap_or_default())))
                .map_err(|e| StoreError::Internal(format!("building request for {uri}: {e}")))?;

            match self.client.request(req).await {
                Ok(resp) => {
                    let status = resp.status();
                    let bytes = resp
                        .into_body()
                        .collect()
                        .await
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?
                        .to_bytes();
                    return Ok((status, bytes));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(StoreError::Unavailable(format!(
            "all etcd2 endpoints failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn decode_error(status: StatusCode, body: &Bytes) -> StoreError {
        if let Ok(err) = serde_json::from_slice::<ErrorResponse>(body) {
            match err.error_code {
                CODE_NODE_EXIST => StoreError::AlreadyExists,
                code => StoreError::Internal(format!(
                    "etcd2 error {code}: {} (http {status})",
                    err.message
                )),
            }
        } else if status.is_server_error() {
            StoreError::Unavailable(format!("etcd2 returned {status}"))
        } else {
            StoreError::Internal(format!("etcd2 returned {status}"))
        }
    }

    fn decode_value(value: &str) -> StoreResult<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| StoreError::Internal(format!("corrupt stored value: {e}")))
    }

    /// Flatten a recursive listing into ordered `(relative key, bytes)`
    /// pairs, folding `_info` nodes back onto their parent key.
    fn collect_leaves(&self, node: &Node, out: &mut Vec<(String, Vec<u8>)>) -> StoreResult<()> {
        if node.dir {
            for child in &node.nodes {
                self.collect_leaves(child, out)?;
            }
            return Ok(());
        }
        let Some(value) = &node.value else {
            return Ok(());
        };

        let absolute = node.key.trim_start_matches('/');
        let prefix = self.prefix.trim_start_matches('/');
        let mut relative = absolute
            .strip_prefix(prefix)
            .unwrap_or(absolute)
            .trim_start_matches('/')
            .to_string();
        if let Some(parent) = relative.strip_suffix(&format!("/{INFO_NODE}")) {
            relative = parent.to_string();
        }
        out.push((relative, Self::decode_value(value)?));
        Ok(())
    }
}

#[async_trait]
impl Kv for Etcd2Store {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let (status, body) = self
            .request(Method::GET, &self.record_path(key), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::decode_error(status, &body));
        }
        let resp: KeysResponse = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Internal(format!("etcd2 response: {e}")))?;
        match resp.node.and_then(|n| n.value) {
            Some(value) => Ok(Some(Self::decode_value(&value)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let path = format!("{}?recursive=true&sorted=true", self.path(prefix));
        let (status, body) = self.request(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Self::decode_error(status, &body));
        }
        let resp: KeysResponse = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Internal(format!("etcd2 response: {e}")))?;

        let mut out = Vec::new();
        if let Some(node) = resp.node {
            self.collect_leaves(&node, &mut out)?;
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let path = format!("{}?prevExist=false", self.record_path(key));
        let body = format!("value={}", URL_SAFE_NO_PAD.encode(&value));
        let (status, resp_body) = self.request(Method::PUT, &path, Some(body)).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::decode_error(status, &resp_body))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let path = self.record_path(key);
        let body = format!("value={}", URL_SAFE_NO_PAD.encode(&value));
        let (status, resp_body) = self.request(Method::PUT, &path, Some(body)).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::decode_error(status, &resp_body))
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let (status, body) = self
            .request(Method::DELETE, &self.record_path(key), None)
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::decode_error(status, &body))
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let path = format!("{}?recursive=true", self.path(prefix));
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::decode_error(status, &body))
        }
    }

    fn subscribe(&self, mut stop: watch::Receiver<bool>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let client = self.client.clone();
        let endpoints = self.endpoints.clone();
        let base = self.path("");

        tokio::spawn(async move {
            let mut wait_index: Option<u64> = None;
            while !*stop.borrow() {
                let query = match wait_index {
                    Some(index) => format!("{base}?wait=true&recursive=true&waitIndex={index}"),
                    None => format!("{base}?wait=true&recursive=true"),
                };
                let uri = format!("{}{query}", endpoints[0]);
                let req = Request::builder()
                    .method(Method::GET)
                    .uri(&uri)
                    .body(Full::new(Bytes::new()));
                let Ok(req) = req else { break };

                let poll = async {
                    let resp = client.request(req).await.ok()?;
                    let status = resp.status();
                    let body = resp.into_body().collect().await.ok()?.to_bytes();
                    Some((status, body))
                };

                tokio::select! {
                    result = poll => match result {
                        Some((status, body)) if status.is_success() => {
                            if let Ok(resp) = serde_json::from_slice::<KeysResponse>(&body) {
                                if let Some(node) = resp.node {
                                    wait_index = Some(node.modified_index + 1);
                                }
                            }
                            signal_change(&tx);
                        }
                        Some((_, body)) => {
                            // An outdated waitIndex means changes happened
                            // while we were away; signal and start fresh.
                            let cleared = serde_json::from_slice::<ErrorResponse>(&body)
                                .map(|e| e.error_code == CODE_EVENT_INDEX_CLEARED)
                                .unwrap_or(false);
                            if cleared {
                                signal_change(&tx);
                            }
                            wait_index = None;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            tracing::warn!("etcd2 watch poll failed, retrying");
                            wait_index = None;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = stop.changed() => break,
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Etcd2Store {
        Etcd2Store {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/merlin".to_string(),
        }
    }

    #[test]
    fn record_paths_fold_service_records_into_info_nodes() {
        let store = store();
        assert_eq!(
            store.record_path("services/service1"),
            "/v2/keys/merlin/services/service1/_info"
        );
        assert_eq!(
            store.record_path("services/service1/servers/172.16.1.1:9090"),
            "/v2/keys/merlin/services/service1/servers/172.16.1.1:9090"
        );
    }

    #[test]
    fn listing_translates_info_nodes_back() {
        let store = store();
        let tree = Node {
            key: "/merlin/services".to_string(),
            value: None,
            dir: true,
            modified_index: 0,
            nodes: vec![Node {
                key: "/merlin/services/service1".to_string(),
                value: None,
                dir: true,
                modified_index: 0,
                nodes: vec![
                    Node {
                        key: "/merlin/services/service1/_info".to_string(),
                        value: Some(URL_SAFE_NO_PAD.encode(b"svc")),
                        dir: false,
                        modified_index: 3,
                        nodes: vec![],
                    },
                    Node {
                        key: "/merlin/services/service1/servers/172.16.1.1:9090".to_string(),
                        value: Some(URL_SAFE_NO_PAD.encode(b"srv")),
                        dir: false,
                        modified_index: 4,
                        nodes: vec![],
                    },
                ],
            }],
        };

        let mut out = Vec::new();
        store.collect_leaves(&tree, &mut out).unwrap();
        out.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            out,
            vec![
                ("services/service1".to_string(), b"svc".to_vec()),
                (
                    "services/service1/servers/172.16.1.1:9090".to_string(),
                    b"srv".to_vec()
                ),
            ]
        );
    }
}
