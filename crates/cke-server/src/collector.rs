//! Observation of the actual cluster state.
//!
//! Every probe failure is logged and folded into a zero-valued status; a
//! collection never fails as a whole.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_core::resource::ResourceDefinition;
use cke_core::status::{
    ClusterStatus, EtcdClusterStatus, EtcdMember, KubernetesClusterStatus, NodeStatus, ResourceStatus,
    ServiceStatus,
};
use cke_infra::container::ContainerInfo;
use cke_infra::etcd::{client_url, is_in_sync, url_host};
use cke_infra::{ContainerEngine, Infrastructure, KubeApi, ServiceParamsFile};
use cke_op::Service;
use cke_op::etcd::{leader_status, quorum_healthy};
use cke_op::maintain::{
    APISERVER_TO_KUBELET_ROLE, CLUSTER_DNS_CONFIG_NAME, CLUSTER_DNS_ROLE, ETCD_ENDPOINTS_NAME, SYSTEM_NAMESPACE,
};
use cke_op::service::ETCD_VOLUME;
use futures::future::join_all;
use tracing::{debug, warn};

const ALL_SERVICES: [Service; 7] = [
    Service::Rivers,
    Service::Etcd,
    Service::ApiServer,
    Service::ControllerManager,
    Service::Scheduler,
    Service::Kubelet,
    Service::Proxy,
];

/// Observe `cluster`: every node in parallel, then the etcd and Kubernetes views.
///
/// Live annotations are read for the engine-owned definitions in `owned` and
/// the user definitions in `resources`.
pub async fn collect(
    infra: &dyn Infrastructure,
    cluster: &Cluster,
    owned: &[ResourceDefinition],
    resources: &[ResourceDefinition],
) -> ClusterStatus {
    let probes = cluster.nodes.iter().map(|n| async move {
        let status = match node_status(infra, n).await {
            Ok(s) => s,
            Err(e) => {
                warn!(node = %n.address, error = %format!("{e:#}"), "node probe failed");
                NodeStatus::default()
            }
        };
        (n.address.clone(), status)
    });
    let node_statuses: BTreeMap<String, NodeStatus> = join_all(probes).await.into_iter().collect();

    let etcd = match etcd_status(infra, cluster, &node_statuses).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "etcd probe failed");
            EtcdClusterStatus::default()
        }
    };
    let kubernetes = match kubernetes_status(infra, cluster, &node_statuses, owned.iter().chain(resources)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "kubernetes probe failed");
            KubernetesClusterStatus::default()
        }
    };

    ClusterStatus {
        name: cluster.name.clone(),
        etcd,
        kubernetes,
        node_statuses,
    }
}

fn service_status(infos: &HashMap<String, ContainerInfo>, name: &str, params: Option<ServiceParamsFile>) -> ServiceStatus {
    let Some(info) = infos.get(name) else {
        return ServiceStatus::default();
    };
    if !info.running {
        return ServiceStatus::default();
    }
    let params = params.unwrap_or_default();
    ServiceStatus {
        running: true,
        image: info.image.clone(),
        started_at: info.started_at,
        built_in_params: params.built_in,
        extra_params: params.extra,
        healthy: true,
    }
}

async fn node_status(infra: &dyn Infrastructure, node: &Node) -> Result<NodeStatus> {
    let Some(agent) = infra.agent(&node.address).await else {
        debug!(node = %node.address, "node is unreachable");
        return Ok(NodeStatus::default());
    };
    let engine = ContainerEngine::new(agent);
    let names: Vec<&str> = ALL_SERVICES.iter().map(|s| s.name()).collect();
    let infos = engine.inspect(&names).await?;

    let mut ns = NodeStatus {
        ssh_connected: true,
        ..Default::default()
    };
    for svc in ALL_SERVICES {
        let params = if infos.contains_key(svc.name()) {
            engine.read_params(svc.name()).await?
        } else {
            None
        };
        let kubelet = params.as_ref().and_then(|p| p.kubelet.clone());
        let st = service_status(&infos, svc.name(), params);
        match svc {
            Service::Rivers => ns.rivers = st,
            Service::Etcd => ns.etcd.service = st,
            Service::ApiServer => ns.apiserver = st,
            Service::ControllerManager => ns.controller_manager = st,
            Service::Scheduler => ns.scheduler = st,
            Service::Kubelet => {
                if let Some(k) = kubelet {
                    ns.kubelet.domain = k.domain;
                    ns.kubelet.allow_swap = k.allow_swap;
                }
                ns.kubelet.service = st;
            }
            Service::Proxy => ns.proxy = st,
        }
    }
    ns.etcd.has_data = engine.volume_exists(ETCD_VOLUME).await?;
    Ok(ns)
}

async fn etcd_status(
    infra: &dyn Infrastructure,
    cluster: &Cluster,
    nodes: &BTreeMap<String, NodeStatus>,
) -> Result<EtcdClusterStatus> {
    let endpoints: Vec<String> = cluster
        .control_planes()
        .filter(|n| nodes.get(&n.address).is_some_and(|s| s.etcd.service.running))
        .map(|n| client_url(&n.address))
        .collect();
    if endpoints.is_empty() {
        return Ok(EtcdClusterStatus::default());
    }
    let etcd = infra.etcd(&endpoints).await?;

    let mut status = EtcdClusterStatus::default();
    for m in etcd.member_list().await? {
        let Some(addr) = m.peer_urls.first().and_then(|u| url_host(u)) else {
            continue;
        };
        status.members.insert(
            addr.to_string(),
            EtcdMember {
                id: m.id,
                name: m.name.clone(),
            },
        );
    }
    let member_eps: Vec<String> = status.members.keys().map(|a| client_url(a)).collect();
    status.is_healthy = quorum_healthy(etcd.as_ref(), &member_eps).await;

    let mut progress = Vec::new();
    for addr in status.members.keys() {
        if let Ok(s) = etcd.status(&client_url(addr)).await {
            progress.push((addr.clone(), s));
        }
    }
    let all: Vec<_> = progress.iter().map(|(_, s)| *s).collect();
    if let Some(leader) = leader_status(&all) {
        for (addr, s) in &progress {
            let healthy = etcd.health(&client_url(addr)).await.unwrap_or(false);
            status
                .in_sync_members
                .insert(addr.clone(), is_in_sync(&leader, s, healthy));
        }
    }
    Ok(status)
}

/// Client of the first running apiserver that reports ready.
async fn ready_apiserver(
    infra: &dyn Infrastructure,
    cluster: &Cluster,
    nodes: &BTreeMap<String, NodeStatus>,
) -> Option<Arc<dyn KubeApi>> {
    let running = cluster
        .control_planes()
        .filter(|n| nodes.get(&n.address).is_some_and(|s| s.apiserver.running));
    for node in running {
        let kube = match infra.kube(cluster, node).await {
            Ok(k) => k,
            Err(e) => {
                warn!(node = %node.address, error = %format!("{e:#}"), "apiserver connection failed");
                continue;
            }
        };
        match kube.is_ready().await {
            Ok(true) => return Some(kube),
            Ok(false) => debug!(node = %node.address, "apiserver is not ready"),
            Err(e) => warn!(node = %node.address, error = %format!("{e:#}"), "apiserver readiness check failed"),
        }
    }
    None
}

async fn kubernetes_status<'a>(
    infra: &dyn Infrastructure,
    cluster: &Cluster,
    nodes: &BTreeMap<String, NodeStatus>,
    resources: impl Iterator<Item = &'a ResourceDefinition>,
) -> Result<KubernetesClusterStatus> {
    let Some(kube) = ready_apiserver(infra, cluster, nodes).await else {
        return Ok(KubernetesClusterStatus::default());
    };

    let mut status = KubernetesClusterStatus {
        is_control_plane_ready: true,
        nodes: kube.list_nodes().await?,
        rbac_installed: kube.cluster_role_exists(APISERVER_TO_KUBELET_ROLE).await?
            && kube.cluster_role_exists(CLUSTER_DNS_ROLE).await?,
        dns_config: kube.get_config_map(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIG_NAME).await?,
        etcd_endpoints: kube.get_endpoints(SYSTEM_NAMESPACE, ETCD_ENDPOINTS_NAME).await?,
        resource_statuses: BTreeMap::new(),
    };
    for def in resources {
        if let Some(annotations) = kube.get_annotations(def).await? {
            status
                .resource_statuses
                .insert(def.key.clone(), ResourceStatus { annotations });
        }
    }
    Ok(status)
}
