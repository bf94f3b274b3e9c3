use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ServiceParams;

/// Observed state of one component container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub image: String,
    pub started_at: Option<DateTime<Utc>>,
    pub built_in_params: ServiceParams,
    pub extra_params: ServiceParams,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdStatus {
    pub service: ServiceStatus,
    /// The data volume exists on the host.
    pub has_data: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletStatus {
    pub service: ServiceStatus,
    pub domain: String,
    pub allow_swap: bool,
}

/// Observed state of one node. A failed probe leaves it at its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub ssh_connected: bool,
    pub etcd: EtcdStatus,
    pub rivers: ServiceStatus,
    pub apiserver: ServiceStatus,
    pub controller_manager: ServiceStatus,
    pub scheduler: ServiceStatus,
    pub proxy: ServiceStatus,
    pub kubelet: KubeletStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdMember {
    pub id: u64,
    /// Empty until the member has started for the first time.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdClusterStatus {
    pub is_healthy: bool,
    /// Membership keyed by the member's peer address.
    pub members: BTreeMap<String, EtcdMember>,
    pub in_sync_members: BTreeMap<String, bool>,
}

impl EtcdClusterStatus {
    pub fn is_in_sync(&self, address: &str) -> bool {
        self.in_sync_members.get(address).copied().unwrap_or(false)
    }
}

/// The parts of a Kubernetes Node object the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeNode {
    pub name: String,
    pub ready: bool,
    pub unschedulable: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    pub addresses: Vec<String>,
    pub ports: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesClusterStatus {
    pub is_control_plane_ready: bool,
    pub nodes: Vec<KubeNode>,
    pub rbac_installed: bool,
    /// Data of `kube-system/cke-cluster-dns`, if it exists.
    pub dns_config: Option<BTreeMap<String, String>>,
    /// Subsets of `kube-system/cke-etcd`, if it exists.
    pub etcd_endpoints: Option<Vec<EndpointSubset>>,
    /// Keyed by resource definition key.
    pub resource_statuses: BTreeMap<String, ResourceStatus>,
}

impl KubernetesClusterStatus {
    pub fn node(&self, name: &str) -> Option<&KubeNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Observed counterpart of a Cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub etcd: EtcdClusterStatus,
    pub kubernetes: KubernetesClusterStatus,
    pub node_statuses: BTreeMap<String, NodeStatus>,
}

impl ClusterStatus {
    /// Status of `address`, or the zero status if it was never probed.
    pub fn node(&self, address: &str) -> NodeStatus {
        self.node_statuses.get(address).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_node_is_zero_valued() {
        let s = ClusterStatus::default();
        let n = s.node("10.0.0.1");
        assert!(!n.ssh_connected);
        assert!(!n.etcd.has_data);
        assert!(!n.kubelet.service.running);
    }

    #[test]
    fn test_in_sync_lookup() {
        let mut e = EtcdClusterStatus::default();
        e.in_sync_members.insert("10.0.0.1".into(), true);
        e.in_sync_members.insert("10.0.0.2".into(), false);
        assert!(e.is_in_sync("10.0.0.1"));
        assert!(!e.is_in_sync("10.0.0.2"));
        assert!(!e.is_in_sync("10.0.0.3"));
    }
}
