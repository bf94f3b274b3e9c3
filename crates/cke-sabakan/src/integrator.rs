use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use cke_core::cluster::Cluster;
use cke_core::constraints::Constraints;
use cke_core::is_not_found;
use cke_core::repair::RepairQueueEntry;
use cke_storage::Storage;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::SabakanClient;
use crate::generator::ClusterGenerator;
use crate::machine::{Machine, MachineState};
use crate::metrics::SabakanMetrics;

/// `Ok(None)` for a missing key.
async fn optional<T>(fut: impl Future<Output = Result<T>>) -> Result<Option<T>> {
    match fut.await {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_variables(raw: Option<Vec<u8>>) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(b) => serde_json::from_slice(&b).context("decode query variables"),
    }
}

/// Generates the cluster from the inventory and enqueues repairs for broken machines.
pub struct Integrator {
    http: reqwest::Client,
    metrics: Arc<SabakanMetrics>,
}

impl Integrator {
    pub fn new(http: reqwest::Client, metrics: Arc<SabakanMetrics>) -> Self {
        Self { http, metrics }
    }

    /// Regenerate the cluster and store it if it changed.
    ///
    /// Does nothing while the integration is disabled or not configured.
    pub async fn run_once(&self, storage: &Storage, leader: &str) -> Result<()> {
        if storage.is_sabakan_disabled().await? {
            return Ok(());
        }
        let Some(url) = optional(storage.get_sabakan_url()).await? else {
            return Ok(());
        };
        let Some((template, _revision)) = optional(storage.get_sabakan_template()).await? else {
            debug!("no cluster template, skipping inventory integration");
            return Ok(());
        };
        let variables = parse_variables(optional(storage.get_sabakan_query_variables()).await?)?;
        let constraints = optional(storage.get_constraints()).await?.unwrap_or_default();
        let current = optional(storage.get_cluster()).await?;

        let machines = match SabakanClient::new(self.http.clone(), &url).search_machines(&variables).await {
            Ok(m) => m,
            Err(e) => {
                self.metrics.record_failure(Utc::now());
                return Err(e);
            }
        };
        match self.generate(&template, &constraints, &machines, current.as_ref()) {
            Ok((Some(next), workers, unused)) => {
                storage.update_cluster(leader, &next).await?;
                info!(nodes = next.nodes.len(), "cluster regenerated from inventory");
                self.metrics.record_success(workers, unused, Utc::now());
            }
            Ok((None, workers, unused)) => self.metrics.record_success(workers, unused, Utc::now()),
            Err(e) => {
                self.metrics.record_failure(Utc::now());
                return Err(e);
            }
        }
        Ok(())
    }

    fn generate(
        &self,
        template: &Cluster,
        constraints: &Constraints,
        machines: &[Machine],
        current: Option<&Cluster>,
    ) -> Result<(Option<Cluster>, BTreeMap<String, usize>, usize)> {
        let generator = ClusterGenerator::new(template, constraints, machines)?;
        let next = match current {
            None => Some(generator.generate()?),
            Some(c) => generator.update(c)?,
        };
        if let Some(n) = &next {
            n.validate(false).context("generated cluster is invalid")?;
            constraints.check(n)?;
        }
        let effective = next.as_ref().or(current).context("no cluster")?;
        Ok((
            next.clone(),
            generator.worker_counts(effective),
            generator.unused_count(effective),
        ))
    }

    /// Enqueue repairs for cluster machines the inventory reports as broken.
    ///
    /// Addresses with an unfinished repair are skipped, and so are nodes being
    /// rebooted until they have been broken for `wait-seconds-to-repair-rebooting`.
    /// The queue never grows past `maximum-repair-queue-entries` unfinished entries.
    pub async fn run_auto_repair(&self, storage: &Storage) -> Result<()> {
        if storage.is_auto_repair_disabled().await? {
            return Ok(());
        }
        let Some(url) = optional(storage.get_sabakan_url()).await? else {
            return Ok(());
        };
        let Some(raw) = optional(storage.get_auto_repair_query_variables()).await? else {
            return Ok(());
        };
        let variables = parse_variables(Some(raw))?;
        let Some(cluster) = optional(storage.get_cluster()).await? else {
            return Ok(());
        };
        let constraints = optional(storage.get_constraints()).await?.unwrap_or_default();

        let machines = SabakanClient::new(self.http.clone(), &url)
            .search_machines(&variables)
            .await?;
        let entries = storage.get_repair_entries().await?;
        let rebooting: HashSet<String> = storage
            .get_reboot_entries()
            .await?
            .into_iter()
            .filter(|e| e.is_in_progress())
            .map(|e| e.node)
            .collect();

        let mut active: HashSet<String> = entries
            .iter()
            .filter(|e| !e.has_finished() && !e.deleted)
            .map(|e| e.address.clone())
            .collect();
        let wait = constraints.wait_seconds_to_repair_rebooting as f64;

        for m in &machines {
            let operation = match m.state() {
                MachineState::Unhealthy => "unhealthy",
                MachineState::Unreachable => "unreachable",
                _ => continue,
            };
            let Some(address) = m.address() else {
                continue;
            };
            if cluster.node(address).is_none() || active.contains(address) {
                continue;
            }
            if rebooting.contains(address) && m.status.duration < wait {
                debug!(address, "machine is rebooting, repair deferred");
                continue;
            }
            if active.len() >= constraints.maximum_repair_queue_entries {
                warn!(
                    address,
                    limit = constraints.maximum_repair_queue_entries,
                    "repair queue is full, not enqueueing"
                );
                break;
            }
            let mut entry = RepairQueueEntry::new(operation, &m.spec.bmc.bmc_type, address, &m.spec.serial);
            entry.fill_nodename(&cluster);
            storage.register_repair_entry(&mut entry).await?;
            info!(address, operation, index = entry.index, "repair enqueued from inventory");
            active.insert(address.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::serve;
    use crate::machine::tests::machine;
    use cke_core::node::Node;
    use cke_core::reboot::{RebootQueueEntry, RebootStatus};
    use cke_storage::MemoryKv;

    const TEMPLATE: &str = r#"
name: tmpl
service_subnet: 10.68.0.0/16
nodes:
  - user: cybozu
    control_plane: true
  - user: cybozu
"#;

    async fn setup(machines: Vec<Machine>) -> (Storage, String, Integrator, Arc<SabakanMetrics>) {
        let storage = Storage::new(Arc::new(MemoryKv::new()), "/cke/");
        let leader = storage
            .kv()
            .campaign(&storage.leader_election_name(), "host1", 60)
            .await
            .unwrap()
            .key;
        let (url, _) = serve(machines).await;
        storage.set_sabakan_url(&url).await.unwrap();
        let metrics = Arc::new(SabakanMetrics::default());
        (storage, leader, Integrator::new(reqwest::Client::new(), metrics.clone()), metrics)
    }

    fn fleet() -> Vec<Machine> {
        (1..=4)
            .map(|i| machine(&format!("10.0.0.{i}"), i % 2, "cs", MachineState::Healthy))
            .collect()
    }

    #[tokio::test]
    async fn test_unconfigured_integration_is_noop() {
        let storage = Storage::new(Arc::new(MemoryKv::new()), "/cke/");
        let integrator = Integrator::new(reqwest::Client::new(), Arc::default());
        integrator.run_once(&storage, "/cke/leader/x").await.unwrap();
        integrator.run_auto_repair(&storage).await.unwrap();
        assert!(is_not_found(&storage.get_cluster().await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_generates_and_stores_cluster() {
        let (storage, leader, integrator, metrics) = setup(fleet()).await;
        storage
            .put_constraints(&Constraints {
                minimum_workers_rate: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        storage
            .set_sabakan_template(&Cluster::from_yaml(TEMPLATE).unwrap())
            .await
            .unwrap();

        integrator.run_once(&storage, &leader).await.unwrap();
        let cluster = storage.get_cluster().await.unwrap();
        assert_eq!(cluster.name, "tmpl");
        assert_eq!(cluster.control_planes().count(), 1);
        assert_eq!(cluster.nodes.len(), 2);

        let snap = metrics.snapshot();
        assert!(snap.successful);
        assert_eq!(snap.workers[""], 1);
        assert_eq!(snap.unused, 2);

        integrator.run_once(&storage, &leader).await.unwrap();
        assert_eq!(storage.get_cluster().await.unwrap(), cluster);
    }

    #[tokio::test]
    async fn test_disabled_integration_leaves_cluster() {
        let (storage, leader, integrator, metrics) = setup(fleet()).await;
        storage
            .set_sabakan_template(&Cluster::from_yaml(TEMPLATE).unwrap())
            .await
            .unwrap();
        storage.enable_sabakan(false).await.unwrap();
        integrator.run_once(&storage, &leader).await.unwrap();
        assert!(is_not_found(&storage.get_cluster().await.unwrap_err()));
        assert_eq!(metrics.snapshot().timestamp, None);
    }

    #[tokio::test]
    async fn test_generation_failure_is_recorded() {
        let (storage, leader, integrator, metrics) = setup(vec![]).await;
        storage
            .set_sabakan_template(&Cluster::from_yaml(TEMPLATE).unwrap())
            .await
            .unwrap();
        assert!(integrator.run_once(&storage, &leader).await.is_err());
        let snap = metrics.snapshot();
        assert!(!snap.successful);
        assert!(snap.timestamp.is_some());
    }

    fn cluster_of(addresses: &[&str]) -> Cluster {
        Cluster {
            name: "c".into(),
            service_subnet: "10.68.0.0/16".into(),
            nodes: addresses
                .iter()
                .enumerate()
                .map(|(i, a)| Node {
                    address: a.to_string(),
                    user: "cybozu".into(),
                    control_plane: i == 0,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_auto_repair_enqueues_broken_members() {
        let mut machines = vec![
            machine("10.0.0.1", 0, "cs", MachineState::Unreachable),
            machine("10.0.0.2", 0, "cs", MachineState::Unhealthy),
            machine("10.0.0.3", 0, "cs", MachineState::Unhealthy),
            machine("10.0.0.9", 0, "cs", MachineState::Unhealthy),
            machine("10.0.0.4", 0, "cs", MachineState::Healthy),
        ];
        machines[2].status.duration = 10.0;
        let (storage, _, integrator, _) = setup(machines).await;
        storage
            .put_cluster(&cluster_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]))
            .await
            .unwrap();
        storage
            .put_constraints(&Constraints {
                maximum_repair_queue_entries: 5,
                wait_seconds_to_repair_rebooting: 60,
                ..Default::default()
            })
            .await
            .unwrap();
        storage.set_auto_repair_query_variables(b"{}").await.unwrap();

        let mut rebooting = RebootQueueEntry::new("10.0.0.3");
        storage.register_reboot_entry(&mut rebooting).await.unwrap();
        rebooting.transition(RebootStatus::Rebooting, Utc::now());
        storage.update_reboot_entry(None, &rebooting).await.unwrap();

        integrator.run_auto_repair(&storage).await.unwrap();
        let entries = storage.get_repair_entries().await.unwrap();
        let got: BTreeMap<&str, &str> = entries
            .iter()
            .map(|e| (e.address.as_str(), e.operation.as_str()))
            .collect();
        assert_eq!(
            got,
            BTreeMap::from([("10.0.0.1", "unreachable"), ("10.0.0.2", "unhealthy")])
        );
        assert_eq!(entries[0].machine_type, "IPMI-2.0");
        assert_eq!(entries[0].nodename, entries[0].address);

        integrator.run_auto_repair(&storage).await.unwrap();
        assert_eq!(storage.get_repair_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_repair_respects_queue_limit() {
        let machines = vec![
            machine("10.0.0.1", 0, "cs", MachineState::Unreachable),
            machine("10.0.0.2", 0, "cs", MachineState::Unhealthy),
        ];
        let (storage, _, integrator, _) = setup(machines).await;
        storage.put_cluster(&cluster_of(&["10.0.0.1", "10.0.0.2"])).await.unwrap();
        storage
            .put_constraints(&Constraints {
                maximum_repair_queue_entries: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        storage.set_auto_repair_query_variables(b"{}").await.unwrap();

        integrator.run_auto_repair(&storage).await.unwrap();
        assert_eq!(storage.get_repair_entries().await.unwrap().len(), 1);

        storage.enable_auto_repair(false).await.unwrap();
        storage
            .put_constraints(&Constraints {
                maximum_repair_queue_entries: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        integrator.run_auto_repair(&storage).await.unwrap();
        assert_eq!(storage.get_repair_entries().await.unwrap().len(), 1);
    }
}
