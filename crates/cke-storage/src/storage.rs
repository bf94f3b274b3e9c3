use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cke_core::Error;
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::constraints::Constraints;
use cke_core::reboot::{RebootQueueEntry, RebootQueueState};
use cke_core::record::{Record, ServerStatus};
use cke_core::repair::RepairQueueEntry;
use cke_core::resource::ResourceDefinition;
use cke_core::vault::VaultConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::kv::{Condition, Kv, TxnOp, WatchEvent};

pub const KEY_CLUSTER: &str = "cluster";
pub const KEY_CONSTRAINTS: &str = "constraints";
pub const KEY_VAULT: &str = "vault";
pub const KEY_CA_PREFIX: &str = "ca/";
pub const KEY_RECORDS_PREFIX: &str = "records/";
pub const KEY_RECORD_ID: &str = "record-id";
pub const KEY_LEADER: &str = "leader";
pub const KEY_STATUS: &str = "status";
pub const KEY_RESOURCE_PREFIX: &str = "resource/";
pub const KEY_SABAKAN_PREFIX: &str = "sabakan/";
pub const KEY_SABAKAN_URL: &str = "sabakan/url";
pub const KEY_SABAKAN_TEMPLATE: &str = "sabakan/template";
pub const KEY_SABAKAN_TEMPLATE_REVISION: &str = "sabakan/template-revision";
pub const KEY_SABAKAN_VARIABLES: &str = "sabakan/variables";
pub const KEY_SABAKAN_DISABLED: &str = "sabakan/disabled";
pub const KEY_AUTO_REPAIR_VARIABLES: &str = "auto-repair/variables";
pub const KEY_AUTO_REPAIR_DISABLED: &str = "auto-repair/disabled";
pub const KEY_REBOOT_PREFIX: &str = "reboot/";
pub const KEY_REBOOT_STATE: &str = "reboot/state";
pub const KEY_REPAIR_PREFIX: &str = "repair/";
pub const KEY_REPAIR_DISABLED: &str = "repair/disabled";
pub const KEY_REPAIR_WRITE_INDEX: &str = "repair/write-index";

/// Operation records kept by default.
pub const DEFAULT_MAX_RECORDS: usize = 1000;

const CAS_ATTEMPTS: usize = 16;

fn index_key(prefix: &str, index: i64) -> String {
    format!("{prefix}{index:016}")
}

fn is_index_key(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(v).context("Failed to encode value")
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).with_context(|| format!("Failed to decode {key}"))
}

/// Typed accessor over the key-value store.
///
/// Keys are relative to `prefix`. Writes that only the leader may perform take
/// the absolute leader key and fail with [`Error::NoLeader`] once it is gone.
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn Kv>,
    prefix: String,
    max_records: usize,
}

impl Storage {
    pub fn new(kv: Arc<dyn Kv>, prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            kv,
            prefix,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    pub fn kv(&self) -> &Arc<dyn Kv> {
        &self.kv
    }

    pub fn key(&self, rel: &str) -> String {
        format!("{}{rel}", self.prefix)
    }

    /// Election name used by the control loop.
    pub fn leader_election_name(&self) -> String {
        self.key(KEY_LEADER)
    }

    async fn get_raw(&self, rel: &str) -> Result<(Vec<u8>, i64)> {
        match self.kv.get(&self.key(rel)).await? {
            Some(kv) => Ok((kv.value, kv.mod_revision)),
            None => Err(Error::NotFound.into()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, rel: &str) -> Result<T> {
        let (data, _) = self.get_raw(rel).await?;
        decode(rel, &data)
    }

    async fn get_flag(&self, rel: &str) -> Result<bool> {
        match self.get_json::<bool>(rel).await {
            Ok(v) => Ok(v),
            Err(e) if cke_core::is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put_raw(&self, rel: &str, value: Vec<u8>) -> Result<()> {
        self.kv.commit(vec![], vec![TxnOp::Put(self.key(rel), value)]).await?;
        Ok(())
    }

    /// Commit with an optional leader witness.
    ///
    /// When the transaction is refused, reports `NoLeader` if the leader key
    /// vanished and `Conflicted` otherwise.
    async fn commit_guarded(&self, leader: Option<&str>, mut conditions: Vec<Condition>, ops: Vec<TxnOp>) -> Result<()> {
        if let Some(leader) = leader {
            conditions.push(Condition::Exists(leader.to_string()));
        }
        if self.kv.commit(conditions, ops).await? {
            return Ok(());
        }
        if let Some(leader) = leader {
            if self.kv.get(leader).await?.is_none() {
                return Err(Error::NoLeader.into());
            }
        }
        Err(Error::Conflicted("transaction conditions failed".into()).into())
    }

    // Cluster and constraints

    pub async fn get_cluster(&self) -> Result<Cluster> {
        self.get_json(KEY_CLUSTER).await
    }

    pub async fn put_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.put_raw(KEY_CLUSTER, encode(cluster)?).await
    }

    /// Replace the cluster on behalf of the leader (inventory integration).
    pub async fn update_cluster(&self, leader: &str, cluster: &Cluster) -> Result<()> {
        self.commit_guarded(Some(leader), vec![], vec![TxnOp::Put(self.key(KEY_CLUSTER), encode(cluster)?)])
            .await
    }

    pub async fn get_constraints(&self) -> Result<Constraints> {
        self.get_json(KEY_CONSTRAINTS).await
    }

    pub async fn put_constraints(&self, constraints: &Constraints) -> Result<()> {
        self.put_raw(KEY_CONSTRAINTS, encode(constraints)?).await
    }

    // Certificates and secret store

    pub async fn get_ca_certificate(&self, name: CaName) -> Result<String> {
        let (data, _) = self.get_raw(&format!("{KEY_CA_PREFIX}{name}")).await?;
        String::from_utf8(data).context("CA certificate is not UTF-8")
    }

    pub async fn put_ca_certificate(&self, leader: Option<&str>, name: CaName, pem: &str) -> Result<()> {
        let key = self.key(&format!("{KEY_CA_PREFIX}{name}"));
        self.commit_guarded(leader, vec![], vec![TxnOp::Put(key, pem.as_bytes().to_vec())])
            .await
    }

    pub async fn get_vault_config(&self) -> Result<VaultConfig> {
        self.get_json(KEY_VAULT).await
    }

    pub async fn put_vault_config(&self, cfg: &VaultConfig) -> Result<()> {
        cfg.validate()?;
        self.put_raw(KEY_VAULT, encode(cfg)?).await
    }

    // Records

    /// Allocate the next record id.
    pub async fn next_record_id(&self) -> Result<i64> {
        let key = self.key(KEY_RECORD_ID);
        for _ in 0..CAS_ATTEMPTS {
            let (id, cond) = match self.kv.get(&key).await? {
                Some(kv) => (decode::<i64>(KEY_RECORD_ID, &kv.value)?, Condition::ModRevision(key.clone(), kv.mod_revision)),
                None => (1, Condition::Absent(key.clone())),
            };
            if self.kv.commit(vec![cond], vec![TxnOp::Put(key.clone(), encode(&(id + 1))?)]).await? {
                return Ok(id);
            }
            debug!("record id contended, retrying");
        }
        Err(Error::Conflicted("record id allocation".into()).into())
    }

    /// Store a new record and reclaim the oldest ones beyond the limit.
    pub async fn register_record(&self, leader: &str, record: &Record) -> Result<()> {
        let key = self.key(&index_key(KEY_RECORDS_PREFIX, record.id));
        self.commit_guarded(Some(leader), vec![Condition::Absent(key.clone())], vec![TxnOp::Put(key, encode(record)?)])
            .await
            .with_context(|| format!("register record {}", record.id))?;
        self.reclaim_records(leader).await
    }

    pub async fn update_record(&self, leader: &str, record: &Record) -> Result<()> {
        let key = self.key(&index_key(KEY_RECORDS_PREFIX, record.id));
        self.commit_guarded(Some(leader), vec![], vec![TxnOp::Put(key, encode(record)?)])
            .await
            .with_context(|| format!("update record {}", record.id))
    }

    async fn reclaim_records(&self, leader: &str) -> Result<()> {
        let all = self.kv.get_prefix(&self.key(KEY_RECORDS_PREFIX), None, false).await?;
        if all.len() <= self.max_records {
            return Ok(());
        }
        let excess = all.len() - self.max_records;
        let ops = all.into_iter().take(excess).map(|kv| TxnOp::Delete(kv.key)).collect();
        self.commit_guarded(Some(leader), vec![], ops).await?;
        info!(count = excess, "reclaimed old records");
        Ok(())
    }

    /// Most recent records, newest first.
    pub async fn get_records(&self, limit: usize) -> Result<Vec<Record>> {
        let kvs = self
            .kv
            .get_prefix(&self.key(KEY_RECORDS_PREFIX), Some(limit), true)
            .await?;
        kvs.iter().map(|kv| decode(&kv.key, &kv.value)).collect()
    }

    // Reboot queue

    async fn reboot_state(&self) -> Result<(RebootQueueState, Condition)> {
        let key = self.key(KEY_REBOOT_STATE);
        Ok(match self.kv.get(&key).await? {
            Some(kv) => (decode(KEY_REBOOT_STATE, &kv.value)?, Condition::ModRevision(key, kv.mod_revision)),
            None => (RebootQueueState::default(), Condition::Absent(key)),
        })
    }

    /// Append an entry; the index is assigned here.
    pub async fn register_reboot_entry(&self, entry: &mut RebootQueueEntry) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut state, cond) = self.reboot_state().await?;
            entry.index = state.write_index;
            state.write_index += 1;
            let ops = vec![
                TxnOp::Put(self.key(&index_key(KEY_REBOOT_PREFIX, entry.index)), encode(entry)?),
                TxnOp::Put(self.key(KEY_REBOOT_STATE), encode(&state)?),
            ];
            if self.kv.commit(vec![cond], ops).await? {
                return Ok(());
            }
        }
        Err(Error::Conflicted("reboot queue index allocation".into()).into())
    }

    /// Overwrite an existing entry.
    ///
    /// An entry read from storage is only written if nobody changed it since;
    /// otherwise this fails with `Conflicted`. Fails with `NotFound` if the
    /// entry was dequeued.
    pub async fn update_reboot_entry(&self, leader: Option<&str>, entry: &RebootQueueEntry) -> Result<()> {
        let key = self.key(&index_key(KEY_REBOOT_PREFIX, entry.index));
        self.commit_existing(leader, key, entry.revision, encode(entry)?).await
    }

    async fn commit_existing(&self, leader: Option<&str>, key: String, revision: i64, value: Vec<u8>) -> Result<()> {
        let cond = if revision > 0 {
            Condition::ModRevision(key.clone(), revision)
        } else {
            Condition::Exists(key.clone())
        };
        match self.commit_guarded(leader, vec![cond], vec![TxnOp::Put(key.clone(), value)]).await {
            Err(e) if cke_core::is_conflicted(&e) => {
                if self.kv.get(&key).await?.is_none() {
                    return Err(Error::NotFound.into());
                }
                debug!(key = %key, revision, "entry changed since it was read");
                Err(Error::Conflicted(format!("{key} was modified concurrently")).into())
            }
            other => other,
        }
    }

    pub async fn get_reboot_entry(&self, index: i64) -> Result<RebootQueueEntry> {
        let rel = index_key(KEY_REBOOT_PREFIX, index);
        let (data, revision) = self.get_raw(&rel).await?;
        let mut entry: RebootQueueEntry = decode(&rel, &data)?;
        entry.revision = revision;
        Ok(entry)
    }

    /// All entries in index order.
    pub async fn get_reboot_entries(&self) -> Result<Vec<RebootQueueEntry>> {
        let prefix = self.key(KEY_REBOOT_PREFIX);
        let kvs = self.kv.get_prefix(&prefix, None, false).await?;
        kvs.iter()
            .filter(|kv| is_index_key(&kv.key, &prefix))
            .map(|kv| {
                let mut entry: RebootQueueEntry = decode(&kv.key, &kv.value)?;
                entry.revision = kv.mod_revision;
                Ok(entry)
            })
            .collect()
    }

    pub async fn delete_reboot_entry(&self, leader: &str, index: i64) -> Result<()> {
        let key = self.key(&index_key(KEY_REBOOT_PREFIX, index));
        self.commit_guarded(Some(leader), vec![], vec![TxnOp::Delete(key)]).await
    }

    pub async fn enable_reboot_queue(&self, enabled: bool) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut state, cond) = self.reboot_state().await?;
            state.disabled = !enabled;
            if self
                .kv
                .commit(vec![cond], vec![TxnOp::Put(self.key(KEY_REBOOT_STATE), encode(&state)?)])
                .await?
            {
                return Ok(());
            }
        }
        Err(Error::Conflicted("reboot queue state".into()).into())
    }

    pub async fn is_reboot_queue_disabled(&self) -> Result<bool> {
        Ok(self.reboot_state().await?.0.disabled)
    }

    // Repair queue

    pub async fn register_repair_entry(&self, entry: &mut RepairQueueEntry) -> Result<()> {
        let key = self.key(KEY_REPAIR_WRITE_INDEX);
        for _ in 0..CAS_ATTEMPTS {
            let (index, cond) = match self.kv.get(&key).await? {
                Some(kv) => (decode::<i64>(KEY_REPAIR_WRITE_INDEX, &kv.value)?, Condition::ModRevision(key.clone(), kv.mod_revision)),
                None => (0, Condition::Absent(key.clone())),
            };
            entry.index = index;
            let ops = vec![
                TxnOp::Put(self.key(&index_key(KEY_REPAIR_PREFIX, index)), encode(entry)?),
                TxnOp::Put(key.clone(), encode(&(index + 1))?),
            ];
            if self.kv.commit(vec![cond], ops).await? {
                return Ok(());
            }
        }
        Err(Error::Conflicted("repair queue index allocation".into()).into())
    }

    /// Overwrite an existing entry, with the same revision check as
    /// [`Storage::update_reboot_entry`].
    pub async fn update_repair_entry(&self, leader: Option<&str>, entry: &RepairQueueEntry) -> Result<()> {
        let key = self.key(&index_key(KEY_REPAIR_PREFIX, entry.index));
        self.commit_existing(leader, key, entry.revision, encode(entry)?).await
    }

    pub async fn get_repair_entry(&self, index: i64) -> Result<RepairQueueEntry> {
        let rel = index_key(KEY_REPAIR_PREFIX, index);
        let (data, revision) = self.get_raw(&rel).await?;
        let mut entry: RepairQueueEntry = decode(&rel, &data)?;
        entry.revision = revision;
        Ok(entry)
    }

    pub async fn get_repair_entries(&self) -> Result<Vec<RepairQueueEntry>> {
        let prefix = self.key(KEY_REPAIR_PREFIX);
        let kvs = self.kv.get_prefix(&prefix, None, false).await?;
        kvs.iter()
            .filter(|kv| is_index_key(&kv.key, &prefix))
            .map(|kv| {
                let mut entry: RepairQueueEntry = decode(&kv.key, &kv.value)?;
                entry.revision = kv.mod_revision;
                Ok(entry)
            })
            .collect()
    }

    pub async fn delete_repair_entry(&self, leader: Option<&str>, index: i64) -> Result<()> {
        let key = self.key(&index_key(KEY_REPAIR_PREFIX, index));
        self.commit_guarded(leader, vec![], vec![TxnOp::Delete(key)]).await
    }

    pub async fn enable_repair_queue(&self, enabled: bool) -> Result<()> {
        self.put_raw(KEY_REPAIR_DISABLED, encode(&!enabled)?).await
    }

    pub async fn is_repair_queue_disabled(&self) -> Result<bool> {
        self.get_flag(KEY_REPAIR_DISABLED).await
    }

    // Resources

    /// Make the stored set equal to `defs`. Unchanged objects keep their revision.
    pub async fn replace_resources(&self, defs: &[ResourceDefinition]) -> Result<()> {
        let prefix = self.key(KEY_RESOURCE_PREFIX);
        let current: BTreeMap<String, Vec<u8>> = self
            .kv
            .get_prefix(&prefix, None, false)
            .await?
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();

        let mut ops = Vec::new();
        let mut wanted = std::collections::BTreeSet::new();
        for def in defs {
            let key = format!("{prefix}{}", def.key);
            let body = encode(&def.definition)?;
            if current.get(&key) != Some(&body) {
                ops.push(TxnOp::Put(key.clone(), body));
            }
            wanted.insert(key);
        }
        for key in current.keys().filter(|k| !wanted.contains(*k)) {
            ops.push(TxnOp::Delete(key.clone()));
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.kv.commit(vec![], ops).await?;
        Ok(())
    }

    pub async fn put_resource(&self, def: &ResourceDefinition) -> Result<()> {
        self.put_raw(&format!("{KEY_RESOURCE_PREFIX}{}", def.key), encode(&def.definition)?)
            .await
    }

    /// Stored definitions with their revisions, unsorted.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>> {
        let prefix = self.key(KEY_RESOURCE_PREFIX);
        let kvs = self.kv.get_prefix(&prefix, None, false).await?;
        kvs.iter()
            .map(|kv| {
                ResourceDefinition::from_stored(&kv.value, kv.mod_revision)
                    .with_context(|| format!("resource {}", kv.key))
            })
            .collect()
    }

    pub async fn get_resource(&self, key: &str) -> Result<ResourceDefinition> {
        let (data, rev) = self.get_raw(&format!("{KEY_RESOURCE_PREFIX}{key}")).await?;
        ResourceDefinition::from_stored(&data, rev)
    }

    pub async fn delete_resource(&self, key: &str) -> Result<()> {
        self.kv
            .commit(vec![], vec![TxnOp::Delete(self.key(&format!("{KEY_RESOURCE_PREFIX}{key}")))])
            .await?;
        Ok(())
    }

    // Inventory integration

    pub async fn get_sabakan_url(&self) -> Result<String> {
        let (data, _) = self.get_raw(KEY_SABAKAN_URL).await?;
        String::from_utf8(data).context("sabakan url is not UTF-8")
    }

    pub async fn set_sabakan_url(&self, url: &str) -> Result<()> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::bad_request(format!("invalid sabakan URL: {url}")).into());
        }
        self.put_raw(KEY_SABAKAN_URL, url.as_bytes().to_vec()).await
    }

    /// Template cluster and its revision (a digest of its content).
    pub async fn get_sabakan_template(&self) -> Result<(Cluster, String)> {
        let tmpl = self.get_json(KEY_SABAKAN_TEMPLATE).await?;
        let rev = match self.get_raw(KEY_SABAKAN_TEMPLATE_REVISION).await {
            Ok((rev, _)) => String::from_utf8(rev).context("template revision is not UTF-8")?,
            Err(e) if cke_core::is_not_found(&e) => String::new(),
            Err(e) => return Err(e),
        };
        Ok((tmpl, rev))
    }

    pub async fn set_sabakan_template(&self, tmpl: &Cluster) -> Result<()> {
        let body = encode(tmpl)?;
        let digest = Sha256::digest(&body);
        let rev: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.kv
            .commit(
                vec![],
                vec![
                    TxnOp::Put(self.key(KEY_SABAKAN_TEMPLATE), body),
                    TxnOp::Put(self.key(KEY_SABAKAN_TEMPLATE_REVISION), rev.into_bytes()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_sabakan_query_variables(&self) -> Result<Vec<u8>> {
        Ok(self.get_raw(KEY_SABAKAN_VARIABLES).await?.0)
    }

    pub async fn set_sabakan_query_variables(&self, vars: &[u8]) -> Result<()> {
        serde_json::from_slice::<serde_json::Value>(vars)
            .map_err(|e| Error::bad_request(format!("variables must be JSON: {e}")))?;
        self.put_raw(KEY_SABAKAN_VARIABLES, vars.to_vec()).await
    }

    pub async fn enable_sabakan(&self, enabled: bool) -> Result<()> {
        self.put_raw(KEY_SABAKAN_DISABLED, encode(&!enabled)?).await
    }

    pub async fn is_sabakan_disabled(&self) -> Result<bool> {
        self.get_flag(KEY_SABAKAN_DISABLED).await
    }

    /// Changes to any inventory integration key.
    pub async fn watch_sabakan(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        self.kv.watch_prefix(&self.key(KEY_SABAKAN_PREFIX)).await
    }

    pub async fn get_auto_repair_query_variables(&self) -> Result<Vec<u8>> {
        Ok(self.get_raw(KEY_AUTO_REPAIR_VARIABLES).await?.0)
    }

    pub async fn set_auto_repair_query_variables(&self, vars: &[u8]) -> Result<()> {
        serde_json::from_slice::<serde_json::Value>(vars)
            .map_err(|e| Error::bad_request(format!("variables must be JSON: {e}")))?;
        self.put_raw(KEY_AUTO_REPAIR_VARIABLES, vars.to_vec()).await
    }

    pub async fn enable_auto_repair(&self, enabled: bool) -> Result<()> {
        self.put_raw(KEY_AUTO_REPAIR_DISABLED, encode(&!enabled)?).await
    }

    pub async fn is_auto_repair_disabled(&self) -> Result<bool> {
        self.get_flag(KEY_AUTO_REPAIR_DISABLED).await
    }

    // Leadership and status

    pub async fn get_leader_hostname(&self) -> Result<String> {
        self.kv
            .leader_value(&self.leader_election_name())
            .await?
            .ok_or_else(|| Error::NotFound.into())
    }

    pub async fn get_status(&self) -> Result<ServerStatus> {
        self.get_json(KEY_STATUS).await
    }

    pub async fn put_status(&self, leader: &str, status: &ServerStatus) -> Result<()> {
        self.commit_guarded(Some(leader), vec![], vec![TxnOp::Put(self.key(KEY_STATUS), encode(status)?)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use cke_core::node::Node;
    use cke_core::reboot::RebootStatus;
    use cke_core::record::{OperationPhase, RecordStatus};
    use cke_core::repair::RepairStatus;

    fn storage() -> Storage {
        Storage::new(Arc::new(MemoryKv::new()), "/cke/")
    }

    async fn leader(s: &Storage) -> String {
        s.kv().campaign(&s.leader_election_name(), "host1", 60).await.unwrap().key
    }

    fn cluster() -> Cluster {
        Cluster {
            name: "test".into(),
            nodes: vec![Node {
                address: "10.0.0.1".into(),
                user: "cybozu".into(),
                control_plane: true,
                ..Default::default()
            }],
            service_subnet: "10.68.0.0/16".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cluster_roundtrip_and_not_found() {
        let s = storage();
        let err = s.get_cluster().await.unwrap_err();
        assert!(cke_core::is_not_found(&err));
        let c = cluster();
        s.put_cluster(&c).await.unwrap();
        assert_eq!(s.get_cluster().await.unwrap(), c);
    }

    #[tokio::test]
    async fn test_constraints_and_ca() {
        let s = storage();
        let mut c = Constraints::default();
        c.control_plane_count = 3;
        s.put_constraints(&c).await.unwrap();
        assert_eq!(s.get_constraints().await.unwrap().control_plane_count, 3);

        s.put_ca_certificate(None, CaName::Server, "PEM").await.unwrap();
        assert_eq!(s.get_ca_certificate(CaName::Server).await.unwrap(), "PEM");
        assert!(cke_core::is_not_found(&s.get_ca_certificate(CaName::Webhook).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_record_ids_increase_and_reclaim() {
        let s = storage().with_max_records(3);
        let lk = leader(&s).await;
        let mut last = 0;
        for _ in 0..5 {
            let id = s.next_record_id().await.unwrap();
            assert!(id > last);
            last = id;
            let mut r = Record::new(id, "op", vec![], &lk);
            s.register_record(&lk, &r).await.unwrap();
            r.complete();
            s.update_record(&lk, &r).await.unwrap();
        }
        let records = s.get_records(10).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
    }

    #[tokio::test]
    async fn test_no_leader_after_key_deleted() {
        let s = storage();
        let lk = leader(&s).await;
        s.kv().commit(vec![], vec![TxnOp::Delete(lk.clone())]).await.unwrap();
        let r = Record::new(1, "op", vec![], &lk);
        let err = s.register_record(&lk, &r).await.unwrap_err();
        assert!(cke_core::is_no_leader(&err));
        assert!(s.get_records(10).await.unwrap().is_empty());
        let err = s.update_cluster(&lk, &cluster()).await.unwrap_err();
        assert!(cke_core::is_no_leader(&err));
        assert!(cke_core::is_not_found(&s.get_cluster().await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_reboot_queue() {
        let s = storage();
        let mut a = RebootQueueEntry::new("10.0.0.1");
        let mut b = RebootQueueEntry::new("10.0.0.2");
        s.register_reboot_entry(&mut a).await.unwrap();
        s.register_reboot_entry(&mut b).await.unwrap();
        assert!(b.index > a.index);

        let entries = s.get_reboot_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].node, "10.0.0.1");

        let mut e = s.get_reboot_entry(b.index).await.unwrap();
        e.status = RebootStatus::Cancelled;
        s.update_reboot_entry(None, &e).await.unwrap();
        assert_eq!(s.get_reboot_entry(b.index).await.unwrap().status, RebootStatus::Cancelled);

        let lk = leader(&s).await;
        s.delete_reboot_entry(&lk, a.index).await.unwrap();
        assert!(cke_core::is_not_found(&s.update_reboot_entry(Some(&lk), &a).await.unwrap_err()));

        assert!(!s.is_reboot_queue_disabled().await.unwrap());
        s.enable_reboot_queue(false).await.unwrap();
        assert!(s.is_reboot_queue_disabled().await.unwrap());
        // The state key must not show up as an entry.
        assert_eq!(s.get_reboot_entries().await.unwrap().len(), 1);

        let mut c = RebootQueueEntry::new("10.0.0.3");
        s.register_reboot_entry(&mut c).await.unwrap();
        assert!(c.index > b.index);
        assert!(s.is_reboot_queue_disabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_entry_update_is_conflicted() {
        let s = storage();
        let mut a = RebootQueueEntry::new("10.0.0.1");
        s.register_reboot_entry(&mut a).await.unwrap();

        let mut leader_view = s.get_reboot_entry(a.index).await.unwrap();
        let mut cli_view = s.get_reboot_entry(a.index).await.unwrap();
        assert!(leader_view.revision > 0);

        cli_view.status = RebootStatus::Cancelled;
        s.update_reboot_entry(None, &cli_view).await.unwrap();

        leader_view.status = RebootStatus::Rebooting;
        let err = s.update_reboot_entry(None, &leader_view).await.unwrap_err();
        assert!(cke_core::is_conflicted(&err));
        assert_eq!(s.get_reboot_entry(a.index).await.unwrap().status, RebootStatus::Cancelled);

        // A fresh read carries the new revision and may be written.
        let mut fresh = s.get_reboot_entries().await.unwrap().remove(0);
        assert!(fresh.revision > leader_view.revision);
        fresh.reset_backoff();
        s.update_reboot_entry(None, &fresh).await.unwrap();

        let mut r = RepairQueueEntry::new("unreachable", "qemu", "10.0.0.2", "");
        s.register_repair_entry(&mut r).await.unwrap();
        let stale = s.get_repair_entry(r.index).await.unwrap();
        let mut marked = s.get_repair_entries().await.unwrap().remove(0);
        marked.deleted = true;
        s.update_repair_entry(None, &marked).await.unwrap();
        let err = s.update_repair_entry(None, &stale).await.unwrap_err();
        assert!(cke_core::is_conflicted(&err));
        assert!(s.get_repair_entry(r.index).await.unwrap().deleted);

        let lk = leader(&s).await;
        s.delete_repair_entry(Some(&lk), r.index).await.unwrap();
        assert!(cke_core::is_not_found(&s.update_repair_entry(None, &stale).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_repair_queue() {
        let s = storage();
        let mut a = RepairQueueEntry::new("unreachable", "qemu", "10.0.0.1", "");
        let mut b = RepairQueueEntry::new("unhealthy", "qemu", "10.0.0.2", "");
        s.register_repair_entry(&mut a).await.unwrap();
        s.register_repair_entry(&mut b).await.unwrap();
        assert_eq!((a.index, b.index), (0, 1));

        b.status = RepairStatus::Failed;
        s.update_repair_entry(None, &b).await.unwrap();
        let all = s.get_repair_entries().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].status, RepairStatus::Failed);

        s.delete_repair_entry(None, a.index).await.unwrap();
        assert_eq!(s.get_repair_entries().await.unwrap().len(), 1);

        s.enable_repair_queue(false).await.unwrap();
        assert!(s.is_repair_queue_disabled().await.unwrap());
        s.enable_repair_queue(true).await.unwrap();
        assert!(!s.is_repair_queue_disabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_resources_keeps_unchanged_revisions() {
        let s = storage();
        let defs = cke_core::resource::parse_resources(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n",
        )
        .unwrap();
        s.replace_resources(&defs).await.unwrap();
        let before = s.get_resource("Namespace/a").await.unwrap().revision;

        s.replace_resources(&defs[..1]).await.unwrap();
        let listed = s.list_resources().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "Namespace/a");
        assert_eq!(listed[0].revision, before);

        s.delete_resource("Namespace/a").await.unwrap();
        assert!(s.list_resources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sabakan_settings() {
        let s = storage();
        assert!(s.set_sabakan_url("sabakan:10080").await.is_err());
        s.set_sabakan_url("http://sabakan:10080").await.unwrap();
        assert_eq!(s.get_sabakan_url().await.unwrap(), "http://sabakan:10080");

        let mut rx = s.watch_sabakan().await.unwrap();
        s.set_sabakan_template(&cluster()).await.unwrap();
        let (tmpl, rev) = s.get_sabakan_template().await.unwrap();
        assert_eq!(tmpl.name, "test");
        assert_eq!(rev.len(), 64);
        assert!(rx.recv().await.unwrap().key.starts_with("/cke/sabakan/"));

        assert!(s.set_sabakan_query_variables(b"not json").await.is_err());
        s.set_sabakan_query_variables(br#"{"having":{"labels":[]}}"#).await.unwrap();

        assert!(!s.is_sabakan_disabled().await.unwrap());
        s.enable_sabakan(false).await.unwrap();
        assert!(s.is_sabakan_disabled().await.unwrap());

        assert!(!s.is_auto_repair_disabled().await.unwrap());
        s.enable_auto_repair(false).await.unwrap();
        assert!(s.is_auto_repair_disabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_sabakan_template_revision_errors_propagate() {
        let s = storage();
        s.put_raw(KEY_SABAKAN_TEMPLATE, encode(&cluster()).unwrap()).await.unwrap();
        let (_, rev) = s.get_sabakan_template().await.unwrap();
        assert!(rev.is_empty());

        s.put_raw(KEY_SABAKAN_TEMPLATE_REVISION, vec![0xff, 0xfe]).await.unwrap();
        let err = s.get_sabakan_template().await.unwrap_err();
        assert!(err.to_string().contains("not UTF-8"));
    }

    #[tokio::test]
    async fn test_leader_and_status() {
        let s = storage();
        assert!(cke_core::is_not_found(&s.get_leader_hostname().await.unwrap_err()));
        let lk = leader(&s).await;
        assert_eq!(s.get_leader_hostname().await.unwrap(), "host1");

        let status = ServerStatus {
            phase: OperationPhase::Completed,
            timestamp: chrono::Utc::now(),
            leader: "host1".into(),
            record_id: None,
        };
        s.put_status(&lk, &status).await.unwrap();
        assert_eq!(s.get_status().await.unwrap().phase, OperationPhase::Completed);
    }
}
