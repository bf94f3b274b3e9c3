use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_core::status::{ClusterStatus, EtcdMember, KubeNode, NodeStatus, ServiceStatus};
use cke_infra::fake::FakeInfra;
use cke_op::Service;
use cke_op::maintain::{cluster_dns_data, etcd_endpoint_subsets};

pub const LEADER: &str = "/cke/leader/test";

/// Cluster with `cps` control planes at 10.0.0.1.. and `workers` at 10.0.1.1..
pub fn test_cluster(cps: usize, workers: usize) -> Cluster {
    let node = |address: String, control_plane: bool| Node {
        address,
        user: "cybozu".into(),
        control_plane,
        ..Default::default()
    };
    let mut nodes: Vec<Node> = (1..=cps).map(|i| node(format!("10.0.0.{i}"), true)).collect();
    nodes.extend((1..=workers).map(|i| node(format!("10.0.1.{i}"), false)));
    Cluster {
        name: "test".into(),
        nodes,
        service_subnet: "10.68.0.0/16".into(),
        pod_subnet: "10.64.0.0/14".into(),
        dns_servers: vec!["10.0.0.53".into()],
        ..Default::default()
    }
}

/// Up-to-date running instance of `svc` on `node`.
pub fn running(svc: Service, cluster: &Cluster, node: &Node) -> ServiceStatus {
    ServiceStatus {
        running: true,
        image: svc.image().to_string(),
        built_in_params: svc.built_in(cluster, node),
        extra_params: svc.extra(cluster).clone(),
        healthy: true,
        ..Default::default()
    }
}

/// Status of a cluster that needs nothing.
pub fn converged(cluster: &Cluster) -> ClusterStatus {
    let mut st = ClusterStatus {
        name: cluster.name.clone(),
        ..Default::default()
    };
    for (i, n) in cluster.nodes.iter().enumerate() {
        let mut ns = NodeStatus {
            ssh_connected: true,
            rivers: running(Service::Rivers, cluster, n),
            ..Default::default()
        };
        ns.kubelet.service = running(Service::Kubelet, cluster, n);
        ns.kubelet.domain = cluster.options.kubelet.domain.clone();
        ns.kubelet.allow_swap = cluster.options.kubelet.allow_swap;
        ns.proxy = running(Service::Proxy, cluster, n);
        if n.control_plane {
            ns.etcd.service = running(Service::Etcd, cluster, n);
            ns.etcd.has_data = true;
            ns.apiserver = running(Service::ApiServer, cluster, n);
            ns.controller_manager = running(Service::ControllerManager, cluster, n);
            ns.scheduler = running(Service::Scheduler, cluster, n);
            st.etcd.members.insert(
                n.address.clone(),
                EtcdMember {
                    id: i as u64 + 1,
                    name: n.address.clone(),
                },
            );
            st.etcd.in_sync_members.insert(n.address.clone(), true);
        }
        st.node_statuses.insert(n.address.clone(), ns);
        st.kubernetes.nodes.push(KubeNode {
            name: n.nodename().to_string(),
            ready: true,
            ..Default::default()
        });
    }
    st.etcd.is_healthy = true;
    st.kubernetes.is_control_plane_ready = true;
    st.kubernetes.rbac_installed = true;
    st.kubernetes.etcd_endpoints = Some(etcd_endpoint_subsets(cluster));
    st.kubernetes.dns_config = Some(cluster_dns_data(cluster));
    st
}

/// Create the key [`LEADER`] so leader-guarded writes succeed.
pub async fn elect(infra: &FakeInfra) {
    infra
        .storage
        .kv()
        .commit(vec![], vec![cke_storage::TxnOp::Put(LEADER.into(), b"test".to_vec())])
        .await
        .unwrap();
}
