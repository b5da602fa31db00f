//! etcd v3 store backend.
//!
//! Uses the gRPC KV API. Conditional create is a transaction guarded on
//! `create_revision == 0`; listing is a sorted prefix range; subscription is
//! a prefix watch that reconnects on stream failure.

use crate::store::{signal_change, Kv, StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, SortOrder, SortTarget, Txn, TxnOp,
    WatchOptions,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub struct Etcd3Store {
    client: Client,
    prefix: String,
}

impl Etcd3Store {
    /// Connect to the given endpoints. Fails fast if no endpoint is
    /// reachable, so a misconfigured daemon exits instead of idling.
    pub async fn connect(endpoints: &[String], prefix: &str) -> StoreResult<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(classify)?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    fn absolute(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

#[async_trait]
impl Kv for Etcd3Store {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client.get(self.absolute(key), None).await.map_err(classify)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client
            .get(self.absolute(prefix), Some(options))
            .await
            .map_err(classify)?;

        let strip = format!("{}/", self.prefix);
        resp.kvs()
            .iter()
            .map(|kv| {
                let key = kv
                    .key_str()
                    .map_err(|e| StoreError::Internal(format!("non-utf8 key: {e}")))?;
                let relative = key.strip_prefix(&strip).unwrap_or(key).to_string();
                Ok((relative, kv.value().to_vec()))
            })
            .collect()
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let absolute = self.absolute(key);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                absolute.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(absolute.as_str(), value, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(classify)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists)
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .put(self.absolute(key), value, None)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .delete(self.absolute(key), None)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .delete(self.absolute(prefix), Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn subscribe(&self, mut stop: watch::Receiver<bool>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let client = self.client.clone();
        let prefix = format!("{}/", self.prefix);

        tokio::spawn(async move {
            while !*stop.borrow() {
                let mut client = client.clone();
                let stream = client
                    .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                    .await;

                let (_watcher, mut stream) = match stream {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "etcd watch failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            _ = stop.changed() => break,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        msg = stream.message() => match msg {
                            Ok(Some(resp)) => {
                                if !resp.events().is_empty() {
                                    signal_change(&tx);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "etcd watch stream error, reconnecting");
                                break;
                            }
                        },
                        _ = stop.changed() => return,
                    }
                    if *stop.borrow() {
                        return;
                    }
                }
            }
        });

        rx
    }
}

fn classify(err: etcd_client::Error) -> StoreError {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                StoreError::Unavailable(status.to_string())
            }
            tonic::Code::Aborted => StoreError::Conflict(status.to_string()),
            _ => StoreError::Internal(status.to_string()),
        },
        etcd_client::Error::TransportError(e) => StoreError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Internal(other.to_string()),
    }
}
