//! Certificates, keys and kubeconfigs written to nodes before a service starts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::ca::CaName;
use cke_core::cluster::{Cluster, parse_cidr};
use cke_core::node::Node;
use cke_core::record::Command;
use cke_infra::container::ContainerEngine;
use cke_infra::kubeconfig;
use cke_infra::vault::{CertRequest, NODE_ROLE};
use tracing::debug;

use crate::common::{engine, join_addrs};
use crate::operator::{Commander, RunContext};
use crate::parallel;
use crate::service::*;

/// Lifetime of component certificates. Services are restarted long before.
pub const SERVICE_CERT_TTL: &str = "87600h";

/// A file to place on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFile {
    pub path: String,
    pub content: String,
    pub mode: u32,
}

impl NodeFile {
    fn public(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: 0o644,
        }
    }

    fn secret(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: 0o600,
        }
    }
}

async fn issue_pair(
    ctx: &RunContext<'_>,
    ca: CaName,
    req: CertRequest,
    dir: &str,
    stem: &str,
) -> Result<Vec<NodeFile>> {
    let issued = ctx
        .infra
        .certs()
        .issue(ca, &req)
        .await
        .with_context(|| format!("issue {stem} certificate from {ca} CA"))?;
    Ok(vec![
        NodeFile::public(format!("{dir}/{stem}.crt"), issued.certificate),
        NodeFile::secret(format!("{dir}/{stem}.key"), issued.private_key),
    ])
}

async fn ca_file(ctx: &RunContext<'_>, ca: CaName, path: &str) -> Result<NodeFile> {
    let pem = ctx
        .infra
        .storage()
        .get_ca_certificate(ca)
        .await
        .with_context(|| format!("load {ca} CA certificate"))?;
    Ok(NodeFile::public(path, pem))
}

/// First address of the service subnet, the ClusterIP of `kubernetes.default`.
fn kubernetes_service_ip(cluster: &Cluster) -> Result<String> {
    let net = parse_cidr(&cluster.service_subnet)?;
    net.iter()
        .nth(1)
        .map(|ip| ip.to_string())
        .with_context(|| format!("service subnet {} has no usable address", cluster.service_subnet))
}

/// Encryption provider configuration for Secrets.
pub fn encryption_config(key: Option<&str>) -> Result<String> {
    let provider = match key {
        Some(k) => serde_json::json!({"aescbc": {"keys": [{"name": "cke", "secret": k}]}}),
        None => serde_json::json!({"identity": {}}),
    };
    let cfg = serde_json::json!({
        "apiVersion": "apiserver.config.k8s.io/v1",
        "kind": "EncryptionConfiguration",
        "resources": [{"resources": ["secrets"], "providers": [provider, {"identity": {}}]}],
    });
    serde_yaml::to_string(&cfg).context("encode encryption config")
}

/// Files `svc` needs on `node` apart from its kubeconfig.
pub async fn service_files(ctx: &RunContext<'_>, svc: Service, node: &Node) -> Result<Vec<NodeFile>> {
    let cluster = ctx.cluster;
    let addr = node.address.clone();
    let mut files = Vec::new();
    match svc {
        Service::Rivers => {}
        Service::Etcd => {
            let server = CertRequest::new(node.nodename(), SERVICE_CERT_TTL)
                .with_alt_names(["localhost".to_string()])
                .with_ip_sans([addr.clone(), "127.0.0.1".to_string()]);
            files.extend(issue_pair(ctx, CaName::Server, server, ETCD_PKI_DIR, "server").await?);
            let peer = CertRequest::new(node.nodename(), SERVICE_CERT_TTL).with_ip_sans([addr]);
            files.extend(issue_pair(ctx, CaName::EtcdPeer, peer, ETCD_PKI_DIR, "peer").await?);
            files.push(ca_file(ctx, CaName::EtcdClient, &format!("{ETCD_PKI_DIR}/ca-client.crt")).await?);
            files.push(ca_file(ctx, CaName::EtcdPeer, &format!("{ETCD_PKI_DIR}/ca-peer.crt")).await?);
        }
        Service::ApiServer => {
            let domain = &cluster.options.kubelet.domain;
            let alt_names = [
                "kubernetes".to_string(),
                "kubernetes.default".to_string(),
                "kubernetes.default.svc".to_string(),
                format!("kubernetes.default.svc.{domain}"),
                "localhost".to_string(),
            ];
            let serving = CertRequest::new("kubernetes", SERVICE_CERT_TTL)
                .with_alt_names(alt_names)
                .with_ip_sans([addr, "127.0.0.1".to_string(), kubernetes_service_ip(cluster)?]);
            files.push(ca_file(ctx, CaName::Kubernetes, KUBERNETES_CA_FILE).await?);
            files.extend(issue_pair(ctx, CaName::Kubernetes, serving, APISERVER_DIR, "apiserver").await?);
            files.push(ca_file(ctx, CaName::Server, &format!("{APISERVER_DIR}/etcd-ca.crt")).await?);
            let etcd_client = CertRequest::new(ETCD_APISERVER_USER, SERVICE_CERT_TTL);
            files.extend(issue_pair(ctx, CaName::EtcdClient, etcd_client, APISERVER_DIR, "etcd-client").await?);
            files.push(
                ca_file(ctx, CaName::KubernetesAggregation, &format!("{APISERVER_DIR}/aggregation-ca.crt")).await?,
            );
            let proxy = CertRequest::new("front-proxy-client", SERVICE_CERT_TTL);
            files.extend(issue_pair(ctx, CaName::KubernetesAggregation, proxy, APISERVER_DIR, "proxy-client").await?);
            let certs = ctx.infra.certs();
            let sa = certs.service_account_key().await.context("load service account key")?;
            files.push(NodeFile::secret(format!("{APISERVER_DIR}/service-account.key"), sa));
            let key = certs.encryption_key().await.context("load secret encryption key")?;
            files.push(NodeFile::secret(
                format!("{APISERVER_DIR}/encryption.yml"),
                encryption_config(key.as_deref())?,
            ));
        }
        Service::ControllerManager => {
            files.push(ca_file(ctx, CaName::Kubernetes, KUBERNETES_CA_FILE).await?);
            let sa = ctx
                .infra
                .certs()
                .service_account_key()
                .await
                .context("load service account key")?;
            files.push(NodeFile::secret(format!("{CONTROLLER_MANAGER_DIR}/service-account.key"), sa));
        }
        Service::Scheduler | Service::Proxy => {}
        Service::Kubelet => {
            files.push(ca_file(ctx, CaName::Kubernetes, KUBERNETES_CA_FILE).await?);
            let serving = CertRequest::new(node.nodename(), SERVICE_CERT_TTL)
                .with_alt_names([node.nodename().to_string()])
                .with_ip_sans([addr]);
            files.extend(issue_pair(ctx, CaName::Kubernetes, serving, KUBELET_DIR, "kubelet").await?);
            let config = serde_yaml::to_string(&kubelet_config(cluster)).context("encode kubelet config")?;
            files.push(NodeFile::public(format!("{KUBELET_DIR}/config.yml"), config));
        }
    }
    Ok(files)
}

/// Etcd user the apiservers authenticate as.
pub const ETCD_APISERVER_USER: &str = "kube-apiserver";

/// Kubernetes user and kubeconfig path for components that talk to the apiserver.
pub fn kubeconfig_identity(svc: Service, node: &Node) -> Option<(String, &'static str)> {
    match svc {
        Service::ControllerManager => Some(("system:kube-controller-manager".into(), CONTROLLER_MANAGER_DIR)),
        Service::Scheduler => Some(("system:kube-scheduler".into(), SCHEDULER_DIR)),
        Service::Kubelet => Some((format!("system:node:{}", node.nodename()), KUBELET_DIR)),
        Service::Proxy => Some(("system:kube-proxy".into(), PROXY_DIR)),
        _ => None,
    }
}

async fn put_files(engine: &ContainerEngine, files: &[NodeFile]) -> Result<()> {
    for f in files {
        engine
            .put_file(&f.path, f.content.as_bytes(), f.mode)
            .await
            .with_context(|| format!("write {}", f.path))?;
    }
    Ok(())
}

/// Issue and install the certificates of a service on each node.
pub struct IssueCertificates {
    pub service: Service,
    pub nodes: Vec<Node>,
}

#[async_trait]
impl Commander for IssueCertificates {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs: Vec<String> = self.nodes.iter().map(|n| n.address.clone()).collect();
        parallel::on_nodes("issue-certificates", &addrs, |addr| async move {
            let node = self
                .nodes
                .iter()
                .find(|n| n.address == addr)
                .context("node vanished")?;
            let files = service_files(ctx, self.service, node).await?;
            let engine = engine(ctx, addr).await?;
            put_files(&engine, &files).await?;
            debug!(node = %addr, service = %self.service, files = files.len(), "certificates installed");
            Ok(())
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("issue-certificates", join_addrs(&self.nodes)).with_detail(self.service.name())
    }
}

/// Write the kubeconfig of a component that reaches the apiserver through rivers.
pub struct MakeKubeconfig {
    pub service: Service,
    pub nodes: Vec<Node>,
}

#[async_trait]
impl Commander for MakeKubeconfig {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let ca_pem = ctx
            .infra
            .storage()
            .get_ca_certificate(CaName::Kubernetes)
            .await
            .context("load kubernetes CA certificate")?;
        let ca_pem = &ca_pem;
        let addrs: Vec<String> = self.nodes.iter().map(|n| n.address.clone()).collect();
        parallel::on_nodes("make-kubeconfig", &addrs, |addr| async move {
            let node = self
                .nodes
                .iter()
                .find(|n| n.address == addr)
                .context("node vanished")?;
            let Some((user, dir)) = kubeconfig_identity(self.service, node) else {
                return Ok(());
            };
            let mut req = CertRequest::new(user.clone(), SERVICE_CERT_TTL);
            if self.service == Service::Kubelet {
                req = req.with_role(NODE_ROLE);
            }
            let issued = ctx
                .infra
                .certs()
                .issue(CaName::Kubernetes, &req)
                .await
                .with_context(|| format!("issue client certificate for {user}"))?;
            let yaml = kubeconfig::render(
                &ctx.cluster.name,
                &kubeconfig::local_apiserver_url(),
                &user,
                ca_pem,
                &issued.certificate,
                &issued.private_key,
            )?;
            let engine = engine(ctx, addr).await?;
            put_files(&engine, &[NodeFile::secret(format!("{dir}/kubeconfig"), yaml)]).await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("make-kubeconfig", join_addrs(&self.nodes)).with_detail(self.service.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx, seed_cas, test_cluster};
    use cke_infra::fake::FakeInfra;

    #[test]
    fn test_encryption_config_providers() {
        let with_key = encryption_config(Some("c2VjcmV0")).unwrap();
        assert!(with_key.contains("aescbc"));
        assert!(with_key.contains("c2VjcmV0"));
        let without = encryption_config(None).unwrap();
        assert!(!without.contains("aescbc"));
        assert!(without.contains("identity"));
    }

    #[test]
    fn test_kubernetes_service_ip() {
        let c = test_cluster(1, 0);
        assert_eq!(kubernetes_service_ip(&c).unwrap(), "10.68.0.1");
    }

    #[tokio::test]
    async fn test_issue_etcd_certificates() {
        let infra = FakeInfra::new();
        seed_cas(&infra).await;
        let c = test_cluster(1, 0);
        let cmd = IssueCertificates {
            service: Service::Etcd,
            nodes: c.nodes.clone(),
        };
        cmd.run(&ctx(&infra, &c)).await.unwrap();

        let host = infra.host("10.0.0.1");
        assert_eq!(
            host.file("/etc/etcd/pki/server.crt").unwrap(),
            "CERT server 10.0.0.1"
        );
        assert_eq!(
            host.file("/etc/etcd/pki/ca-peer.crt").unwrap(),
            "PEM etcd-peer"
        );
        assert!(host.commands().iter().any(|c| c.contains("chmod 600 /etc/etcd/pki/peer.key")));
        assert_eq!(cmd.command().detail, "etcd");
    }

    #[tokio::test]
    async fn test_kubelet_kubeconfig_uses_node_identity() {
        let infra = FakeInfra::new();
        seed_cas(&infra).await;
        let c = test_cluster(0, 1);
        MakeKubeconfig {
            service: Service::Kubelet,
            nodes: c.nodes.clone(),
        }
        .run(&ctx(&infra, &c))
        .await
        .unwrap();

        let yaml = infra.host("10.0.1.1").file("/etc/kubernetes/kubelet/kubeconfig").unwrap();
        assert!(yaml.contains("https://127.0.0.1:16443"));
        let issued = infra.certs.issued.lock().unwrap().clone();
        assert_eq!(issued, vec![(CaName::Kubernetes, "system:node:10.0.1.1".to_string())]);
    }

    #[tokio::test]
    async fn test_missing_ca_fails() {
        let infra = FakeInfra::new();
        let c = test_cluster(1, 0);
        let err = IssueCertificates {
            service: Service::ControllerManager,
            nodes: c.nodes.clone(),
        }
        .run(&ctx(&infra, &c))
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("kubernetes CA"));
    }
}
