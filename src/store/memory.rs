//! In-memory store backend.
//!
//! An ordered map under a lock, with the same conditional-put and
//! subscription semantics as the remote backends. This is the injection
//! point the repository and reconciler tests run against.

use crate::store::{signal_change, Kv, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    subscribers: Vec<mpsc::Sender<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, for test assertions.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(inner: &mut Inner) {
        inner.subscribers.retain(|tx| !tx.is_closed());
        for tx in &inner.subscribers {
            signal_change(tx);
        }
    }
}

#[async_trait]
impl Kv for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists);
        }
        inner.entries.insert(key.to_string(), value);
        Self::notify(&mut inner);
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.entries.insert(key.to_string(), value);
        Self::notify(&mut inner);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            Self::notify(&mut inner);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if !doomed.is_empty() {
            for key in doomed {
                inner.entries.remove(&key);
            }
            Self::notify(&mut inner);
        }
        Ok(())
    }

    fn subscribe(&self, mut stop: watch::Receiver<bool>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.inner.lock().subscribers.push(tx.clone());
        tokio::spawn(async move {
            // Hold the sender until stop flips so the subscriber entry stays
            // alive exactly as long as the subscription.
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
            drop(tx);
        });
        rx
    }
}
