//! Operators for the managed etcd cluster.
//!
//! Membership changes go through a quorum of the existing members. Every
//! etcd member is named after the address of its node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_core::record::Command;
use cke_infra::EtcdApi;
use cke_infra::etcd::{EndpointStatus, client_url, is_in_sync, peer_url, url_host};
use cke_infra::infra::ETCD_ROOT_USER;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::certs::{ETCD_APISERVER_USER, IssueCertificates};
use crate::common::{
    ImagePull, MakeDirs, RemoveContainer, RunContainer, VolumeCreate, VolumeRemove, WAIT_INTERVAL, addrs_of,
    engine, wait_until,
};
use crate::operator::{Commander, Operator, RunContext, Sequence};
use crate::service::{ETCD_VOLUME, Service, etcd_args};

pub const ETCD_BOOT_TIMEOUT: Duration = Duration::from_secs(600);
pub const ETCD_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Key prefix the apiservers may use.
pub const APISERVER_KEY_PREFIX: &str = "/registry/";

/// Client URLs of the etcd members on control-plane nodes, optionally skipping one.
pub fn endpoints(cluster: &Cluster, except: Option<&str>) -> Vec<String> {
    cluster
        .control_planes()
        .filter(|n| Some(n.address.as_str()) != except)
        .map(|n| client_url(&n.address))
        .collect()
}

/// Whether a majority of `endpoints` answers the health probe.
pub async fn quorum_healthy(etcd: &dyn EtcdApi, endpoints: &[String]) -> bool {
    let mut healthy = 0;
    for ep in endpoints {
        if etcd.health(ep).await.unwrap_or(false) {
            healthy += 1;
        }
    }
    !endpoints.is_empty() && healthy * 2 > endpoints.len()
}

/// Status of the current leader among `statuses`.
pub fn leader_status(statuses: &[EndpointStatus]) -> Option<EndpointStatus> {
    statuses
        .iter()
        .find(|s| s.leader != 0 && s.member_id == s.leader)
        .or_else(|| statuses.iter().max_by_key(|s| s.raft_index))
        .copied()
}

/// Whether the member on `addr` is healthy and keeps up with the leader.
pub async fn member_in_sync(etcd: &dyn EtcdApi, endpoints: &[String], addr: &str) -> Result<bool> {
    let mut statuses = Vec::new();
    for ep in endpoints {
        if let Ok(s) = etcd.status(ep).await {
            statuses.push(s);
        }
    }
    let own = client_url(addr);
    let member = etcd.status(&own).await?;
    statuses.push(member);
    let Some(leader) = leader_status(&statuses) else {
        return Ok(false);
    };
    let healthy = etcd.health(&own).await.unwrap_or(false);
    Ok(is_in_sync(&leader, &member, healthy))
}

/// Wait until a majority of the control-plane members is healthy.
pub struct WaitEtcdCluster {
    pub endpoints: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitEtcdCluster {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        wait_until(ctx, "etcd cluster", self.timeout, WAIT_INTERVAL, || {
            let etcd = etcd.clone();
            async move { Ok(quorum_healthy(etcd.as_ref(), &self.endpoints).await) }
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("wait-etcd-cluster", self.endpoints.join(","))
    }
}

/// Create the users CKE and the apiservers authenticate as.
pub struct SetupEtcdAuth {
    pub endpoints: Vec<String>,
}

#[async_trait]
impl Commander for SetupEtcdAuth {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        etcd.user_add(ETCD_ROOT_USER).await.context("add etcd root user")?;
        etcd.user_add(ETCD_APISERVER_USER)
            .await
            .context("add etcd user for kube-apiserver")?;
        etcd.grant_prefix(ETCD_APISERVER_USER, APISERVER_KEY_PREFIX)
            .await
            .context("grant kube-apiserver prefix")?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("setup-etcd-auth", self.endpoints.join(","))
    }
}

/// Register a new member for `node`, replacing a never-started registration.
pub struct AddEtcdMember {
    pub node: Node,
    pub endpoints: Vec<String>,
    pub stale: Option<u64>,
    added: Arc<Mutex<Option<u64>>>,
}

#[async_trait]
impl Commander for AddEtcdMember {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        if let Some(id) = self.stale {
            etcd.member_remove(id)
                .await
                .with_context(|| format!("remove unstarted member {id:x}"))?;
        }
        let member = etcd
            .member_add(&peer_url(&self.node.address))
            .await
            .with_context(|| format!("add etcd member for {}", self.node.address))?;
        info!(node = %self.node.address, member = member.id, "etcd member added");
        *self.added.lock().await = Some(member.id);
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("add-etcd-member", self.node.address.clone())
    }
}

/// Start etcd on a node joining an existing cluster.
pub struct RunEtcdMember {
    pub node: Node,
    pub endpoints: Vec<String>,
}

#[async_trait]
impl Commander for RunEtcdMember {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        let mut initial = Vec::new();
        for m in etcd.member_list().await? {
            let Some(host) = m.peer_urls.first().and_then(|u| url_host(u)) else {
                continue;
            };
            if host == self.node.address {
                initial.push((self.node.address.clone(), peer_url(host)));
            } else if !m.name.is_empty() {
                initial.push((m.name.clone(), peer_url(host)));
            }
        }
        let mut built_in = Service::Etcd.built_in(ctx.cluster, &self.node);
        built_in.extra_args = etcd_args(&self.node, &initial, false);
        RunContainer {
            service: Service::Etcd,
            nodes: vec![(self.node.clone(), built_in)],
        }
        .run(ctx)
        .await
    }

    fn command(&self) -> Command {
        Command::new("run-container", self.node.address.clone()).with_detail(Service::Etcd.name())
    }
}

/// Wait until the member on `node` is healthy and caught up.
pub struct WaitEtcdSync {
    pub node: Node,
    pub endpoints: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitEtcdSync {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        let addr = self.node.address.as_str();
        wait_until(ctx, "etcd member sync", self.timeout, WAIT_INTERVAL, || {
            let etcd = etcd.clone();
            async move { member_in_sync(etcd.as_ref(), &self.endpoints, addr).await }
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("wait-etcd-sync", self.node.address.clone())
    }
}

pub struct RemoveEtcdMember {
    pub id: u64,
    /// Address of the member's peer URL, for the record.
    pub target: String,
    pub endpoints: Vec<String>,
}

#[async_trait]
impl Commander for RemoveEtcdMember {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        etcd.member_remove(self.id)
            .await
            .with_context(|| format!("remove etcd member {:x}", self.id))?;
        info!(node = %self.target, member = self.id, "etcd member removed");
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("remove-etcd-member", self.target.clone()).with_detail(format!("{:x}", self.id))
    }
}

/// Bootstrap a new etcd cluster on every control-plane node.
pub fn boot_op(cluster: &Cluster) -> Sequence {
    let cps: Vec<Node> = cluster.control_planes().cloned().collect();
    let initial: Vec<(String, String)> = cps
        .iter()
        .map(|n| (n.address.clone(), peer_url(&n.address)))
        .collect();
    let eps = endpoints(cluster, None);
    let run = RunContainer {
        service: Service::Etcd,
        nodes: cps
            .iter()
            .map(|n| {
                let mut p = Service::Etcd.built_in(cluster, n);
                p.extra_args = etcd_args(n, &initial, true);
                (n.clone(), p)
            })
            .collect(),
    };
    Sequence::new(
        "etcd-bootstrap",
        addrs_of(&cps),
        vec![
            Box::new(VolumeCreate {
                nodes: cps.clone(),
                volume: ETCD_VOLUME.into(),
            }),
            Box::new(IssueCertificates {
                service: Service::Etcd,
                nodes: cps.clone(),
            }),
            Box::new(ImagePull {
                nodes: cps.clone(),
                image: Service::Etcd.image().into(),
            }),
            Box::new(MakeDirs {
                nodes: cps.clone(),
                dirs: Service::Etcd.dirs(),
            }),
            Box::new(run),
            Box::new(WaitEtcdCluster {
                endpoints: eps.clone(),
                timeout: ETCD_BOOT_TIMEOUT,
            }),
            Box::new(SetupEtcdAuth { endpoints: eps }),
        ],
    )
}

/// Start stopped members that already have data.
pub fn start_op(cluster: &Cluster, nodes: &[Node]) -> Sequence {
    Sequence::new(
        "etcd-start",
        addrs_of(nodes),
        vec![
            Box::new(IssueCertificates {
                service: Service::Etcd,
                nodes: nodes.to_vec(),
            }),
            Box::new(ImagePull {
                nodes: nodes.to_vec(),
                image: Service::Etcd.image().into(),
            }),
            Box::new(RunContainer::new(cluster, Service::Etcd, nodes)),
            Box::new(WaitEtcdCluster {
                endpoints: endpoints(cluster, None),
                timeout: ETCD_BOOT_TIMEOUT,
            }),
        ],
    )
}

pub fn wait_cluster_op(cluster: &Cluster) -> Sequence {
    let cps: Vec<Node> = cluster.control_planes().cloned().collect();
    Sequence::new(
        "etcd-wait-cluster",
        addrs_of(&cps),
        vec![Box::new(WaitEtcdCluster {
            endpoints: endpoints(cluster, None),
            timeout: ETCD_BOOT_TIMEOUT,
        })],
    )
}

/// Add `node` to the cluster; a failure after the member was registered removes it again.
pub struct AddMemberOp {
    node: Node,
    endpoints: Vec<String>,
    added: Arc<Mutex<Option<u64>>>,
    steps: Sequence,
}

impl AddMemberOp {
    pub fn new(cluster: &Cluster, node: &Node, stale: Option<u64>) -> Self {
        let eps = endpoints(cluster, Some(&node.address));
        let added = Arc::new(Mutex::new(None));
        let nodes = vec![node.clone()];
        let steps: Vec<Box<dyn Commander>> = vec![
            Box::new(AddEtcdMember {
                node: node.clone(),
                endpoints: eps.clone(),
                stale,
                added: added.clone(),
            }),
            Box::new(IssueCertificates {
                service: Service::Etcd,
                nodes: nodes.clone(),
            }),
            Box::new(ImagePull {
                nodes: nodes.clone(),
                image: Service::Etcd.image().into(),
            }),
            Box::new(MakeDirs {
                nodes: nodes.clone(),
                dirs: Service::Etcd.dirs(),
            }),
            Box::new(VolumeCreate {
                nodes,
                volume: ETCD_VOLUME.into(),
            }),
            Box::new(RunEtcdMember {
                node: node.clone(),
                endpoints: eps.clone(),
            }),
            Box::new(WaitEtcdSync {
                node: node.clone(),
                endpoints: eps.clone(),
                timeout: ETCD_SYNC_TIMEOUT,
            }),
        ];
        Self {
            node: node.clone(),
            endpoints: eps,
            added,
            steps: Sequence::new("etcd-add-member", vec![node.address.clone()], steps),
        }
    }
}

#[async_trait]
impl Operator for AddMemberOp {
    fn name(&self) -> String {
        self.steps.name()
    }

    fn targets(&self) -> Vec<String> {
        self.steps.targets()
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        self.steps.next_command()
    }

    async fn cleanup(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        let Some(id) = self.added.lock().await.take() else {
            return Ok(());
        };
        warn!(node = %self.node.address, member = id, "removing half-added etcd member");
        if let Ok(engine) = engine(ctx, &self.node.address).await {
            if let Err(e) = engine.remove(Service::Etcd.name()).await {
                warn!(node = %self.node.address, error = %format!("{e:#}"), "failed to remove etcd container");
            }
        }
        let etcd = ctx.infra.etcd(&self.endpoints).await?;
        etcd.member_remove(id)
            .await
            .with_context(|| format!("remove etcd member {id:x}"))
    }
}

/// Remove a member that does not belong to the cluster.
pub fn remove_member_op(cluster: &Cluster, id: u64, target: &str) -> Sequence {
    Sequence::new(
        "etcd-remove-member",
        vec![target.to_string()],
        vec![Box::new(RemoveEtcdMember {
            id,
            target: target.to_string(),
            endpoints: endpoints(cluster, Some(target)),
        })],
    )
}

/// Remove the member on a node that is no longer a control plane and wipe its data.
pub fn destroy_member_op(cluster: &Cluster, node: &Node, id: u64) -> Sequence {
    let nodes = vec![node.clone()];
    Sequence::new(
        "etcd-destroy-member",
        vec![node.address.clone()],
        vec![
            Box::new(RemoveEtcdMember {
                id,
                target: node.address.clone(),
                endpoints: endpoints(cluster, Some(&node.address)),
            }),
            Box::new(RemoveContainer {
                nodes: nodes.clone(),
                name: Service::Etcd.name().into(),
            }),
            Box::new(VolumeRemove {
                nodes,
                volume: ETCD_VOLUME.into(),
            }),
        ],
    )
}

/// Restart an outdated member and wait for it to catch up.
pub fn restart_op(cluster: &Cluster, node: &Node) -> Sequence {
    let nodes = vec![node.clone()];
    let eps = endpoints(cluster, Some(&node.address));
    Sequence::new(
        "etcd-restart",
        vec![node.address.clone()],
        vec![
            Box::new(IssueCertificates {
                service: Service::Etcd,
                nodes: nodes.clone(),
            }),
            Box::new(ImagePull {
                nodes: nodes.clone(),
                image: Service::Etcd.image().into(),
            }),
            Box::new(RunContainer::new(cluster, Service::Etcd, &nodes)),
            Box::new(WaitEtcdSync {
                node: node.clone(),
                endpoints: eps,
                timeout: ETCD_SYNC_TIMEOUT,
            }),
        ],
    )
}
