use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::kv::{Condition, KeyValue, Kv, LeaderKey, TxnOp, WatchEvent};

const WATCH_BUFFER: usize = 1024;

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    next_lease: i64,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
}

impl Inner {
    fn holds(&self, cond: &Condition) -> bool {
        match cond {
            Condition::Exists(k) => self.data.contains_key(k),
            Condition::Absent(k) => !self.data.contains_key(k),
            Condition::ModRevision(k, rev) => self.data.get(k).map(|kv| kv.mod_revision) == Some(*rev),
        }
    }

    fn put(&mut self, key: String, value: Vec<u8>) {
        let rev = self.revision;
        let create_revision = self.data.get(&key).map(|kv| kv.create_revision).unwrap_or(rev);
        self.data.insert(
            key.clone(),
            KeyValue {
                key: key.clone(),
                value,
                create_revision,
                mod_revision: rev,
            },
        );
        self.notify(&key, false);
    }

    fn delete(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.notify(key, true);
        }
    }

    fn notify(&mut self, key: &str, deleted: bool) {
        self.watchers.retain(|(prefix, tx)| {
            if tx.is_closed() {
                return false;
            }
            if key.starts_with(prefix.as_str()) {
                let _ = tx.try_send(WatchEvent {
                    key: key.to_string(),
                    deleted,
                });
            }
            true
        });
    }

    /// Lowest create revision wins the election.
    fn leader_of(&self, name: &str) -> Option<&KeyValue> {
        let prefix = format!("{name}/");
        self.data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, kv)| kv)
            .min_by_key(|kv| kv.create_revision)
    }
}

/// In-process [`Kv`] used by tests and dry runs.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory kv lock poisoned"))
    }

    /// Current revision of the store.
    pub fn revision(&self) -> i64 {
        self.inner.lock().map(|i| i.revision).unwrap_or_default()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.lock()?.data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str, limit: Option<usize>, descending: bool) -> Result<Vec<KeyValue>> {
        let inner = self.lock()?;
        let matching = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone());
        let mut out: Vec<KeyValue> = if descending {
            let mut all: Vec<KeyValue> = matching.collect();
            all.reverse();
            all
        } else {
            matching.collect()
        };
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn commit(&self, conditions: Vec<Condition>, ops: Vec<TxnOp>) -> Result<bool> {
        {
            let mut inner = self.lock()?;
            if !conditions.iter().all(|c| inner.holds(c)) {
                return Ok(false);
            }
            inner.revision += 1;
            for op in ops {
                match op {
                    TxnOp::Put(k, v) => inner.put(k, v),
                    TxnOp::Delete(k) => inner.delete(&k),
                    TxnOp::DeletePrefix(p) => {
                        let keys: Vec<String> = inner
                            .data
                            .keys()
                            .filter(|k| k.starts_with(&p))
                            .cloned()
                            .collect();
                        for k in keys {
                            inner.delete(&k);
                        }
                    }
                }
            }
        }
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.lock()?.watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }

    async fn campaign(&self, name: &str, value: &str, _ttl_secs: u64) -> Result<LeaderKey> {
        let (key, lease) = {
            let mut inner = self.lock()?;
            inner.next_lease += 1;
            let lease = inner.next_lease;
            (format!("{name}/{lease:016x}"), lease)
        };
        self.commit(
            vec![Condition::Absent(key.clone())],
            vec![TxnOp::Put(key.clone(), value.as_bytes().to_vec())],
        )
        .await?;

        loop {
            let notified = self.changed.notified();
            {
                let inner = self.lock()?;
                let Some(ours) = inner.data.get(&key) else {
                    anyhow::bail!("campaign key {key} was deleted before election");
                };
                if inner.leader_of(name).map(|kv| &kv.key) == Some(&key) {
                    return Ok(LeaderKey {
                        name: name.to_string(),
                        key: key.clone(),
                        lease,
                        revision: ours.create_revision,
                    });
                }
            }
            notified.await;
        }
    }

    async fn resign(&self, leader: &LeaderKey) -> Result<()> {
        self.commit(vec![], vec![TxnOp::Delete(leader.key.clone())]).await?;
        Ok(())
    }

    async fn leader_value(&self, name: &str) -> Result<Option<String>> {
        let inner = self.lock()?;
        Ok(inner
            .leader_of(name)
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned()))
    }
}
