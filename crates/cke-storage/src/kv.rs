use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A stored key with its revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

/// Guard of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists(String),
    Absent(String),
    ModRevision(String, i64),
}

/// Mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put(String, Vec<u8>),
    Delete(String),
    DeletePrefix(String),
}

/// Change notification for a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub deleted: bool,
}

/// Key held by the elected leader; deleting it ends the term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    pub name: String,
    pub key: String,
    pub lease: i64,
    pub revision: i64,
}

/// Strongly consistent key-value store with leader election.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Keys under `prefix` in key order (reversed when `descending`).
    async fn get_prefix(&self, prefix: &str, limit: Option<usize>, descending: bool) -> Result<Vec<KeyValue>>;

    /// Apply `ops` atomically iff every condition holds. Returns whether they held.
    async fn commit(&self, conditions: Vec<Condition>, ops: Vec<TxnOp>) -> Result<bool>;

    /// Stream of changes under `prefix`. Dropping the receiver cancels the watch.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Block until this process wins the election `name`.
    async fn campaign(&self, name: &str, value: &str, ttl_secs: u64) -> Result<LeaderKey>;

    async fn resign(&self, leader: &LeaderKey) -> Result<()>;

    /// Value published by the current leader of `name`, if any.
    async fn leader_value(&self, name: &str) -> Result<Option<String>>;

    /// Raw snapshot of the whole store, for `ckecli etcd local-backup`.
    async fn snapshot(&self) -> Result<Vec<u8>> {
        anyhow::bail!("snapshot is not supported by this backend")
    }
}
