use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_storage::Storage;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::agent::{Agent, DEFAULT_RUN_TIMEOUT, SshAgent};
use crate::etcd::{EtcdApi, EtcdClient, EtcdTls};
use crate::k8s::{KubeApi, KubeClient};
use crate::kubeconfig;
use crate::local::{LocalRunner, ProcessRunner};
use crate::pool::AgentPool;
use crate::vault::{ADMIN_ROLE, CertIssuer, CertRequest, IssuedCert};

/// Common name of the client certificate CKE uses for the managed etcd.
pub const ETCD_ROOT_USER: &str = "root";
/// Common name of CKE's own Kubernetes client certificate.
pub const KUBE_ADMIN_USER: &str = "cke";

const CLIENT_CERT_TTL: &str = "2h";
const ETCD_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles to everything one reconciliation pass talks to.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Pooled agent for `addr`, `None` when the node is unreachable.
    async fn agent(&self, addr: &str) -> Option<Arc<dyn Agent>>;
    async fn etcd(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdApi>>;
    /// Kubernetes client talking to the apiserver on `node`.
    async fn kube(&self, cluster: &Cluster, node: &Node) -> Result<Arc<dyn KubeApi>>;
    fn certs(&self) -> Arc<dyn CertIssuer>;
    fn storage(&self) -> &Storage;
    fn http(&self) -> &reqwest::Client;
    fn local(&self) -> &dyn LocalRunner;
    async fn close(&self);
}

/// Production [`Infrastructure`].
///
/// Created for one pass from the validated nodes of the cluster; client
/// certificates are issued once and shared by every client of the pass.
pub struct CkeInfra {
    storage: Storage,
    certs: Arc<dyn CertIssuer>,
    http: reqwest::Client,
    nodes: HashMap<String, Node>,
    pool: AgentPool,
    runner: ProcessRunner,
    run_timeout: Duration,
    etcd_tls: OnceCell<EtcdTls>,
    kube_cert: OnceCell<(String, IssuedCert)>,
    kube_clients: Mutex<HashMap<String, Arc<dyn KubeApi>>>,
}

impl CkeInfra {
    pub fn new(storage: Storage, certs: Arc<dyn CertIssuer>, http: reqwest::Client, nodes: &[Node]) -> Self {
        Self {
            storage,
            certs,
            http,
            nodes: nodes.iter().map(|n| (n.address.clone(), n.clone())).collect(),
            pool: AgentPool::new(),
            runner: ProcessRunner,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            etcd_tls: OnceCell::new(),
            kube_cert: OnceCell::new(),
            kube_clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    async fn etcd_tls(&self) -> Result<&EtcdTls> {
        self.etcd_tls
            .get_or_try_init(|| async {
                let ca_pem = self
                    .storage
                    .get_ca_certificate(CaName::Server)
                    .await
                    .context("load server CA")?;
                let issued = self
                    .certs
                    .issue(CaName::EtcdClient, &CertRequest::new(ETCD_ROOT_USER, CLIENT_CERT_TTL))
                    .await
                    .context("issue etcd client certificate")?;
                Ok::<_, anyhow::Error>(EtcdTls {
                    ca_pem,
                    cert_pem: issued.certificate,
                    key_pem: issued.private_key,
                })
            })
            .await
    }

    async fn kube_cert(&self) -> Result<&(String, IssuedCert)> {
        self.kube_cert
            .get_or_try_init(|| async {
                let ca_pem = self
                    .storage
                    .get_ca_certificate(CaName::Kubernetes)
                    .await
                    .context("load kubernetes CA")?;
                let issued = self
                    .certs
                    .issue(CaName::Kubernetes, &CertRequest::new(KUBE_ADMIN_USER, CLIENT_CERT_TTL).with_role(ADMIN_ROLE))
                    .await
                    .context("issue kubernetes client certificate")?;
                Ok::<_, anyhow::Error>((ca_pem, issued))
            })
            .await
    }
}

#[async_trait]
impl Infrastructure for CkeInfra {
    async fn agent(&self, addr: &str) -> Option<Arc<dyn Agent>> {
        let node = self.nodes.get(addr)?;
        let timeout = self.run_timeout;
        self.pool
            .get_or_connect(addr, || async move {
                Ok(Arc::new(SshAgent::connect(node, timeout).await?) as Arc<dyn Agent>)
            })
            .await
    }

    async fn etcd(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdApi>> {
        let tls = self.etcd_tls().await?.clone();
        let client = EtcdClient::connect(endpoints, Some(tls), ETCD_TIMEOUT).await?;
        Ok(Arc::new(client))
    }

    async fn kube(&self, cluster: &Cluster, node: &Node) -> Result<Arc<dyn KubeApi>> {
        if let Some(c) = self.kube_clients.lock().await.get(&node.address) {
            return Ok(c.clone());
        }
        let (ca_pem, issued) = self.kube_cert().await?;
        let yaml = kubeconfig::render(
            &cluster.name,
            &kubeconfig::apiserver_url(&node.address),
            KUBE_ADMIN_USER,
            ca_pem,
            &issued.certificate,
            &issued.private_key,
        )?;
        let client: Arc<dyn KubeApi> = Arc::new(KubeClient::from_kubeconfig(&yaml).await?);
        debug!(node = %node.address, "kubernetes client created");
        self.kube_clients
            .lock()
            .await
            .insert(node.address.clone(), client.clone());
        Ok(client)
    }

    fn certs(&self) -> Arc<dyn CertIssuer> {
        self.certs.clone()
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn local(&self) -> &dyn LocalRunner {
        &self.runner
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
