use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::config::EtcdConfig;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    Identity, ResignOptions, SortOrder, SortTarget, TlsOptions, Txn, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::kv::{Condition, KeyValue, Kv, LeaderKey, TxnOp, WatchEvent};

const WATCH_BUFFER: usize = 64;

/// [`Kv`] backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

/// Build connect options (auth, TLS, timeout) from the config.
pub fn connect_options(cfg: &EtcdConfig) -> Result<ConnectOptions> {
    let mut opts = ConnectOptions::new()
        .with_timeout(cfg.timeout())
        .with_connect_timeout(cfg.timeout());
    if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
        opts = opts.with_user(user, password);
    }
    let uses_tls = cfg.tls_ca_file.is_some() || cfg.tls_cert_file.is_some();
    if uses_tls {
        let mut tls = TlsOptions::new();
        if let Some(ca) = &cfg.tls_ca_file {
            let pem = std::fs::read(ca).with_context(|| format!("Failed to read {}", ca.display()))?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        if let (Some(cert), Some(key)) = (&cfg.tls_cert_file, &cfg.tls_key_file) {
            let cert = std::fs::read(cert).with_context(|| format!("Failed to read {}", cert.display()))?;
            let key = std::fs::read(key).with_context(|| format!("Failed to read {}", key.display()))?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        opts = opts.with_tls(tls);
    }
    Ok(opts)
}

impl EtcdKv {
    pub async fn connect(cfg: &EtcdConfig) -> Result<Self> {
        let client = Client::connect(cfg.endpoints.clone(), Some(connect_options(cfg)?))
            .await
            .with_context(|| format!("Failed to connect to etcd at {}", cfg.endpoints.join(",")))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn to_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

fn to_compare(cond: &Condition) -> Compare {
    match cond {
        Condition::Exists(k) => Compare::create_revision(k.as_str(), CompareOp::Greater, 0),
        Condition::Absent(k) => Compare::create_revision(k.as_str(), CompareOp::Equal, 0),
        Condition::ModRevision(k, rev) => Compare::mod_revision(k.as_str(), CompareOp::Equal, *rev),
    }
}

fn to_txn_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put(k, v) => etcd_client::TxnOp::put(k, v, None),
        TxnOp::Delete(k) => etcd_client::TxnOp::delete(k, None),
        TxnOp::DeletePrefix(p) => etcd_client::TxnOp::delete(p, Some(DeleteOptions::new().with_prefix())),
    }
}

#[async_trait]
impl Kv for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .client
            .kv_client()
            .get(key, None)
            .await
            .with_context(|| format!("etcd get {key}"))?;
        Ok(resp.kvs().first().map(to_kv))
    }

    async fn get_prefix(&self, prefix: &str, limit: Option<usize>, descending: bool) -> Result<Vec<KeyValue>> {
        let order = if descending { SortOrder::Descend } else { SortOrder::Ascend };
        let mut opts = GetOptions::new().with_prefix().with_sort(SortTarget::Key, order);
        if let Some(limit) = limit {
            opts = opts.with_limit(limit as i64);
        }
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(opts))
            .await
            .with_context(|| format!("etcd get prefix {prefix}"))?;
        Ok(resp.kvs().iter().map(to_kv).collect())
    }

    async fn commit(&self, conditions: Vec<Condition>, ops: Vec<TxnOp>) -> Result<bool> {
        let txn = Txn::new()
            .when(conditions.iter().map(to_compare).collect::<Vec<_>>())
            .and_then(ops.into_iter().map(to_txn_op).collect::<Vec<_>>());
        let resp = self.client.kv_client().txn(txn).await.context("etcd txn")?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .with_context(|| format!("etcd watch {prefix}"))?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) => {
                            for ev in resp.events() {
                                let Some(kv) = ev.kv() else { continue };
                                let event = WatchEvent {
                                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                                    deleted: ev.event_type() == EventType::Delete,
                                };
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "etcd watch failed");
                            break;
                        }
                    }
                }
            }
            let _ = watcher.cancel().await;
            debug!(prefix = %prefix, "etcd watch closed");
        });
        Ok(rx)
    }

    async fn campaign(&self, name: &str, value: &str, ttl_secs: u64) -> Result<LeaderKey> {
        let lease = self
            .client
            .lease_client()
            .grant(ttl_secs as i64, None)
            .await
            .context("etcd lease grant")?
            .id();

        let (mut keeper, mut responses) = self
            .client
            .lease_client()
            .keep_alive(lease)
            .await
            .context("etcd lease keep-alive")?;
        let interval = Duration::from_secs((ttl_secs / 3).max(1));
        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "lease keep-alive failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(r)) if r.ttl() > 0 => {}
                    _ => {
                        warn!(lease, "lease expired");
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        let resp = self
            .client
            .election_client()
            .campaign(name, value, lease)
            .await
            .with_context(|| format!("etcd campaign {name}"))?;
        let leader = resp.leader().context("campaign response has no leader key")?;
        Ok(LeaderKey {
            name: name.to_string(),
            key: String::from_utf8_lossy(leader.key()).into_owned(),
            lease: leader.lease(),
            revision: leader.rev(),
        })
    }

    async fn resign(&self, leader: &LeaderKey) -> Result<()> {
        let key = etcd_client::LeaderKey::new()
            .with_name(leader.name.as_str())
            .with_key(leader.key.as_str())
            .with_lease(leader.lease)
            .with_rev(leader.revision);
        self.client
            .election_client()
            .resign(Some(ResignOptions::new().with_leader(key)))
            .await
            .context("etcd resign")?;
        let _ = self.client.lease_client().revoke(leader.lease).await;
        Ok(())
    }

    async fn leader_value(&self, name: &str) -> Result<Option<String>> {
        match self.client.election_client().leader(name).await {
            Ok(resp) => Ok(resp.kv().map(|kv| String::from_utf8_lossy(kv.value()).into_owned())),
            // etcd reports "election: no leader" as an error status.
            Err(etcd_client::Error::GRpcStatus(s)) if s.message().contains("no leader") => Ok(None),
            Err(e) => Err(e).with_context(|| format!("etcd leader {name}")),
        }
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let mut stream = self
            .client
            .maintenance_client()
            .snapshot()
            .await
            .context("etcd snapshot")?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.message().await.context("etcd snapshot stream")? {
            out.extend_from_slice(chunk.blob());
        }
        Ok(out)
    }
}
