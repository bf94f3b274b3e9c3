use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::resource::{FIELD_MANAGER, ResourceDefinition};
use cke_core::status::{EndpointSubset, KubeNode};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod};
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::{Api, DynamicObject, EvictParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::pinned_kind;
use kube::{Client, Config};
use serde_json::json;

/// A pod scheduled on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// The pod no longer exists.
    Gone,
    /// A disruption budget refused the eviction.
    Blocked,
}

/// Operations CKE performs against the Kubernetes API.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn is_ready(&self) -> Result<bool>;
    async fn list_nodes(&self) -> Result<Vec<KubeNode>>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Vec<EndpointSubset>>>;
    async fn put_endpoints(&self, namespace: &str, name: &str, subsets: &[EndpointSubset]) -> Result<()>;
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;
    async fn apply_config_map(&self, namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<()>;
    /// Annotations of the live object, `None` when it does not exist.
    async fn get_annotations(&self, def: &ResourceDefinition) -> Result<Option<BTreeMap<String, String>>>;
    /// Force server-side apply of `body` as `def`'s object.
    async fn apply(&self, def: &ResourceDefinition, body: &serde_json::Value) -> Result<()>;
    async fn cluster_role_exists(&self, name: &str) -> Result<bool>;
    async fn cordon(&self, node: &str, unschedulable: bool) -> Result<()>;
    /// Pods on `node` that a drain must evict (DaemonSet and mirror pods excluded).
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodRef>>;
    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome>;
}

fn kube_err(what: &str, e: kube::Error) -> anyhow::Error {
    Error::transient(format!("kubernetes {what}: {e}")).into()
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

/// [`KubeApi`] backed by kube-rs.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Connect with a rendered kubeconfig.
    pub async fn from_kubeconfig(yaml: &str) -> Result<Self> {
        let kc = Kubeconfig::from_yaml(yaml).context("parse kubeconfig")?;
        let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .context("load kubeconfig")?;
        let client = Client::try_from(config).context("build kubernetes client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn dynamic_api(&self, def: &ResourceDefinition) -> Result<Api<DynamicObject>> {
        let (group, version) = split_api_version(&def.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &def.kind);
        let (ar, _caps) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| kube_err(&format!("discover {}", def.kind), e))?;
        Ok(match &def.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn to_kube_node(n: Node) -> KubeNode {
    let ready = n
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    KubeNode {
        name: n.metadata.name.unwrap_or_default(),
        ready,
        unschedulable: n.spec.and_then(|s| s.unschedulable).unwrap_or(false),
        labels: n.metadata.labels.unwrap_or_default(),
    }
}

fn is_drainable(p: &Pod) -> bool {
    let daemonset = p
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let mirror = p
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"));
    let finished = p
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|ph| ph == "Succeeded" || ph == "Failed");
    !daemonset && !mirror && !finished
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn is_ready(&self) -> Result<bool> {
        let req = http::Request::get("/readyz")
            .body(Vec::new())
            .context("build readyz request")?;
        match self.client.request_text(req).await {
            Ok(body) => Ok(body.trim() == "ok"),
            Err(_) => Ok(false),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| kube_err("list nodes", e))?;
        Ok(list.items.into_iter().map(to_kube_node).collect())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Vec<EndpointSubset>>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let ep = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err("get endpoints", e))?;
        Ok(ep.map(|ep| {
            ep.subsets
                .unwrap_or_default()
                .into_iter()
                .map(|s| EndpointSubset {
                    addresses: s.addresses.unwrap_or_default().into_iter().map(|a| a.ip).collect(),
                    ports: s.ports.unwrap_or_default().into_iter().map(|p| p.port).collect(),
                })
                .collect()
        }))
    }

    async fn put_endpoints(&self, namespace: &str, name: &str, subsets: &[EndpointSubset]) -> Result<()> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let subsets: Vec<_> = subsets
            .iter()
            .map(|s| {
                json!({
                    "addresses": s.addresses.iter().map(|ip| json!({"ip": ip})).collect::<Vec<_>>(),
                    "ports": s.ports.iter().map(|p| json!({"port": p})).collect::<Vec<_>>(),
                })
            })
            .collect();
        let body = json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": name, "namespace": namespace},
            "subsets": subsets,
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .map_err(|e| kube_err("apply endpoints", e))?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err("get configmap", e))?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn apply_config_map(&self, namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let body = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": namespace},
            "data": data,
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .map_err(|e| kube_err("apply configmap", e))?;
        Ok(())
    }

    async fn get_annotations(&self, def: &ResourceDefinition) -> Result<Option<BTreeMap<String, String>>> {
        let api = self.dynamic_api(def).await?;
        let obj = api
            .get_opt(&def.name)
            .await
            .map_err(|e| kube_err(&format!("get {}", def.key), e))?;
        Ok(obj.map(|o| o.metadata.annotations.unwrap_or_default()))
    }

    async fn apply(&self, def: &ResourceDefinition, body: &serde_json::Value) -> Result<()> {
        let api = self.dynamic_api(def).await?;
        api.patch(&def.name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(body))
            .await
            .map_err(|e| kube_err(&format!("apply {}", def.key), e))?;
        Ok(())
    }

    async fn cluster_role_exists(&self, name: &str) -> Result<bool> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let role = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err("get clusterrole", e))?;
        Ok(role.is_some())
    }

    async fn cordon(&self, node: &str, unschedulable: bool) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"spec": {"unschedulable": unschedulable}});
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_err(&format!("cordon {node}"), e))?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodRef>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let pods = api
            .list(&lp)
            .await
            .map_err(|e| kube_err("list pods", e))?;
        Ok(pods
            .items
            .into_iter()
            .filter(is_drainable)
            .map(|p| PodRef {
                namespace: p.metadata.namespace.unwrap_or_default(),
                name: p.metadata.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictOutcome::Gone),
            Err(kube::Error::Api(ae)) if ae.code == 429 => Ok(EvictOutcome::Blocked),
            Err(e) => Err(kube_err(&format!("evict {namespace}/{name}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(
            split_api_version("rbac.authorization.k8s.io/v1"),
            ("rbac.authorization.k8s.io", "v1")
        );
    }

    #[test]
    fn test_node_readiness() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        let n = to_kube_node(node);
        assert_eq!(n.name, "n1");
        assert!(n.ready);
        assert!(n.unschedulable);

        let n = to_kube_node(Node::default());
        assert!(!n.ready);
    }

    #[test]
    fn test_daemonset_pods_are_not_drained() {
        let mut p = Pod::default();
        assert!(is_drainable(&p));
        p.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".into(),
            ..Default::default()
        }]);
        assert!(!is_drainable(&p));
    }
}
