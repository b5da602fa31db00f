//! Key-value store abstraction.
//!
//! The repository persists records in a remote key-value backend through the
//! [`Kv`] trait. Keys are relative to a configured prefix (default
//! `/merlin`); backends join the prefix internally. Three backends exist:
//! etcd v3 ([`etcd3`]), etcd v2 ([`etcd2`]), and an in-memory map
//! ([`memory`]) used by tests.
//!
//! Change notification is a coarse signal: `subscribe` yields `()` whenever
//! anything under the prefix changes, at-least-once, without saying what
//! changed. The runtime drains the receiver on a single dispatcher task, so
//! notifications are never handled concurrently.

pub mod etcd2;
pub mod etcd3;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Store failure classification.
///
/// The repository translates these into domain errors; `Unavailable` is the
/// only kind worth retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional put targeted an occupied key.
    #[error("key already exists")]
    AlreadyExists,

    /// The backend is unreachable or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A concurrent write invalidated the operation.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// Unknown backend failure.
    #[error("store internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Abstract operations the repository requires from a backend.
///
/// All keys are relative to the backend's prefix and use `/` separators,
/// e.g. `services/service1/servers/172.16.1.1:9090`.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List all keys under a prefix, ordered by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Write a key only if it does not exist yet.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Write a key unconditionally.
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete every key under a prefix. Idempotent.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;

    /// Subscribe to changes under the backend's prefix.
    ///
    /// The returned channel carries an at-least-once `()` signal per change;
    /// signals coalesce when the consumer lags. The backend's watcher stops
    /// when `stop` flips to true or the receiver is dropped.
    fn subscribe(&self, stop: watch::Receiver<bool>) -> mpsc::Receiver<()>;
}

/// Notify a subscription channel without blocking.
///
/// A full buffer means a signal is already pending, which is enough for the
/// at-least-once contract.
pub(crate) fn signal_change(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}
