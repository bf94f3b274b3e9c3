//! Kubernetes objects the engine itself owns: RBAC, etcd endpoints, DNS config.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_core::record::Command;
use cke_core::resource::ResourceDefinition;
use cke_core::status::EndpointSubset;
use cke_infra::etcd::ETCD_CLIENT_PORT;
use serde_json::{Value, json};
use tracing::info;

use crate::operator::{Commander, RunContext, Sequence};
use crate::static_resources::CLUSTER_DNS_SERVICE_ACCOUNT;

pub const SYSTEM_NAMESPACE: &str = "kube-system";
pub const ETCD_ENDPOINTS_NAME: &str = "cke-etcd";
pub const CLUSTER_DNS_CONFIG_NAME: &str = "cke-cluster-dns";
pub const APISERVER_TO_KUBELET_ROLE: &str = "system:kube-apiserver-to-kubelet";
pub const CLUSTER_DNS_ROLE: &str = "system:cluster-dns";

/// Objects granting the apiserver access to kubelets and cluster DNS its reads.
pub fn rbac_objects() -> Vec<Value> {
    vec![
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {
                "name": APISERVER_TO_KUBELET_ROLE,
                "labels": {"kubernetes.io/bootstrapping": "rbac-defaults"},
                "annotations": {"rbac.authorization.kubernetes.io/autoupdate": "true"},
            },
            "rules": [{
                "apiGroups": [""],
                "resources": ["nodes/proxy", "nodes/stats", "nodes/log", "nodes/spec", "nodes/metrics"],
                "verbs": ["*"],
            }],
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": "system:kube-apiserver",
                "labels": {"kubernetes.io/bootstrapping": "rbac-defaults"},
                "annotations": {"rbac.authorization.kubernetes.io/autoupdate": "true"},
            },
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": APISERVER_TO_KUBELET_ROLE},
            "subjects": [{"apiGroup": "rbac.authorization.k8s.io", "kind": "User", "name": "kubernetes"}],
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": CLUSTER_DNS_ROLE},
            "rules": [
                {"apiGroups": [""], "resources": ["endpoints", "services", "pods", "namespaces"], "verbs": ["list", "watch"]},
                {"apiGroups": ["discovery.k8s.io"], "resources": ["endpointslices"], "verbs": ["list", "watch"]},
            ],
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": CLUSTER_DNS_ROLE},
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": CLUSTER_DNS_ROLE},
            "subjects": [{"kind": "ServiceAccount", "name": CLUSTER_DNS_SERVICE_ACCOUNT, "namespace": SYSTEM_NAMESPACE}],
        }),
    ]
}

/// The one subset the etcd Endpoints object should have.
pub fn etcd_endpoint_subsets(cluster: &Cluster) -> Vec<EndpointSubset> {
    vec![EndpointSubset {
        addresses: cluster.control_planes().map(|n| n.address.clone()).collect(),
        ports: vec![i32::from(ETCD_CLIENT_PORT)],
    }]
}

/// Whether the live etcd Endpoints object differs from the control-plane set.
pub fn etcd_endpoints_outdated(cluster: &Cluster, live: &[EndpointSubset]) -> bool {
    let [subset] = live else {
        return true;
    };
    if subset.ports != [i32::from(ETCD_CLIENT_PORT)] {
        return true;
    }
    let have: BTreeSet<&str> = subset.addresses.iter().map(String::as_str).collect();
    let want: BTreeSet<&str> = cluster.control_planes().map(|n| n.address.as_str()).collect();
    have != want
}

/// Data of the cluster DNS ConfigMap.
pub fn cluster_dns_data(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("domain".to_string(), cluster.options.kubelet.domain.clone()),
        ("dns_servers".to_string(), cluster.dns_servers.join(" ")),
    ])
}

pub struct InstallRbacRole {
    pub api_node: Node,
}

#[async_trait]
impl Commander for InstallRbacRole {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        for obj in rbac_objects() {
            let def = ResourceDefinition::from_value(obj)?;
            kube.apply(&def, &def.definition)
                .await
                .with_context(|| format!("apply {}", def.key))?;
        }
        info!("rbac roles installed");
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("install-rbac-role", self.api_node.address.clone())
    }
}

pub struct PutEtcdEndpoints {
    pub api_node: Node,
    pub subsets: Vec<EndpointSubset>,
    pub create: bool,
}

#[async_trait]
impl Commander for PutEtcdEndpoints {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        kube.put_endpoints(SYSTEM_NAMESPACE, ETCD_ENDPOINTS_NAME, &self.subsets)
            .await
            .context("put etcd endpoints")
    }

    fn command(&self) -> Command {
        let name = if self.create { "create-etcd-endpoints" } else { "update-etcd-endpoints" };
        let addrs = self
            .subsets
            .iter()
            .flat_map(|s| s.addresses.iter().cloned())
            .collect::<Vec<_>>()
            .join(",");
        Command::new(name, format!("{SYSTEM_NAMESPACE}/{ETCD_ENDPOINTS_NAME}")).with_detail(addrs)
    }
}

pub struct ApplyClusterDnsConfig {
    pub api_node: Node,
    pub data: BTreeMap<String, String>,
    pub create: bool,
}

#[async_trait]
impl Commander for ApplyClusterDnsConfig {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        kube.apply_config_map(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIG_NAME, &self.data)
            .await
            .context("apply cluster DNS config map")
    }

    fn command(&self) -> Command {
        let name = if self.create {
            "create-cluster-dns-configmap"
        } else {
            "update-cluster-dns-configmap"
        };
        Command::new(name, format!("{SYSTEM_NAMESPACE}/{CLUSTER_DNS_CONFIG_NAME}"))
    }
}

pub fn install_rbac_op(api_node: &Node) -> Sequence {
    Sequence::new(
        "install-rbac-role",
        vec![api_node.address.clone()],
        vec![Box::new(InstallRbacRole {
            api_node: api_node.clone(),
        })],
    )
}

pub fn etcd_endpoints_op(cluster: &Cluster, api_node: &Node, create: bool) -> Sequence {
    let name = if create { "create-etcd-endpoints" } else { "update-etcd-endpoints" };
    Sequence::new(
        name,
        vec![api_node.address.clone()],
        vec![Box::new(PutEtcdEndpoints {
            api_node: api_node.clone(),
            subsets: etcd_endpoint_subsets(cluster),
            create,
        })],
    )
}

pub fn cluster_dns_op(cluster: &Cluster, api_node: &Node, create: bool) -> Sequence {
    let name = if create {
        "create-cluster-dns-configmap"
    } else {
        "update-cluster-dns-configmap"
    };
    Sequence::new(
        name,
        vec![api_node.address.clone()],
        vec![Box::new(ApplyClusterDnsConfig {
            api_node: api_node.clone(),
            data: cluster_dns_data(cluster),
            create,
        })],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::run_to_end;
    use crate::testutil::{ctx, test_cluster};
    use cke_infra::fake::FakeInfra;

    fn subset(addrs: &[&str], port: i32) -> EndpointSubset {
        EndpointSubset {
            addresses: addrs.iter().map(|s| s.to_string()).collect(),
            ports: vec![port],
        }
    }

    #[test]
    fn test_etcd_endpoints_outdated() {
        let c = test_cluster(2, 1);
        assert!(etcd_endpoints_outdated(&c, &[]));
        assert!(!etcd_endpoints_outdated(&c, &[subset(&["10.0.0.2", "10.0.0.1"], 2379)]));
        assert!(etcd_endpoints_outdated(&c, &[subset(&["10.0.0.1"], 2379)]));
        assert!(etcd_endpoints_outdated(&c, &[subset(&["10.0.0.1", "10.0.0.2"], 2380)]));
        let two = [subset(&["10.0.0.1"], 2379), subset(&["10.0.0.2"], 2379)];
        assert!(etcd_endpoints_outdated(&c, &two));
    }

    #[test]
    fn test_cluster_dns_data() {
        let mut c = test_cluster(1, 0);
        c.dns_servers = vec!["8.8.8.8".into(), "1.1.1.1".into()];
        let data = cluster_dns_data(&c);
        assert_eq!(data["domain"], "cluster.local");
        assert_eq!(data["dns_servers"], "8.8.8.8 1.1.1.1");
    }

    #[tokio::test]
    async fn test_install_rbac() {
        let infra = FakeInfra::new();
        let c = test_cluster(1, 0);
        let mut op = install_rbac_op(&c.nodes[0]);
        run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        let st = infra.kube.state();
        assert!(st.cluster_roles.contains(APISERVER_TO_KUBELET_ROLE));
        assert!(st.cluster_roles.contains(CLUSTER_DNS_ROLE));
        assert_eq!(st.applied.len(), 4);
    }

    #[tokio::test]
    async fn test_create_etcd_endpoints() {
        let infra = FakeInfra::new();
        let c = test_cluster(3, 1);
        let mut op = etcd_endpoints_op(&c, &c.nodes[0], true);
        let done = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        assert_eq!(done[0].name, "create-etcd-endpoints");
        let eps = infra.kube.state().endpoints["kube-system/cke-etcd"].clone();
        assert!(!etcd_endpoints_outdated(&c, &eps));
        assert_eq!(eps[0].addresses.len(), 3);
    }
}
