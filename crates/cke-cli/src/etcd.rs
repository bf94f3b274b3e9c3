use std::time::Duration;

use anyhow::{Context, Result, bail};
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::time::is_snapshot_name;
use cke_core::Error;
use cke_infra::etcd::{EtcdTls, client_url};
use cke_infra::infra::ETCD_ROOT_USER;
use cke_infra::kubeconfig::APISERVER_PORT;
use cke_infra::{CertIssuer, CertRequest, EtcdApi, EtcdClient, VaultClient};
use serde::Serialize;

use crate::context::{CliContext, check_ttl, control_plane};

const ETCD_TIMEOUT: Duration = Duration::from_secs(10);
const BACKUP_SERVICE: &str = "kube-system/services/etcdbackup:8080";

/// Client credentials printed by `etcd root-issue`.
#[derive(Debug, Serialize)]
pub struct IssuedCredentials {
    pub ca_certificate: String,
    pub certificate: String,
    pub private_key: String,
}

/// Issue an etcd client certificate for `user`.
pub async fn issue_client_cert(cx: &CliContext, vault: &VaultClient, user: &str, ttl: &str) -> Result<IssuedCredentials> {
    check_ttl(ttl)?;
    let ca_certificate = cx
        .storage
        .get_ca_certificate(CaName::Server)
        .await
        .context("load server CA")?;
    let issued = vault
        .issue(CaName::EtcdClient, &CertRequest::new(user, ttl))
        .await
        .with_context(|| format!("issue etcd certificate for {user}"))?;
    Ok(IssuedCredentials {
        ca_certificate,
        certificate: issued.certificate,
        private_key: issued.private_key,
    })
}

pub async fn root_issue(cx: &CliContext, ttl: &str) -> Result<IssuedCredentials> {
    let vault = cx.vault().await?;
    issue_client_cert(cx, &vault, ETCD_ROOT_USER, ttl).await
}

fn endpoints(cluster: &Cluster) -> Vec<String> {
    cluster.control_planes().map(|n| client_url(&n.address)).collect()
}

/// Create an etcd user allowed to read and write keys under `prefix`.
pub async fn user_add(cx: &CliContext, name: &str, prefix: &str) -> Result<()> {
    if name.is_empty() || name == ETCD_ROOT_USER {
        return Err(Error::bad_request(format!("invalid etcd user name: {name:?}")).into());
    }
    if !prefix.starts_with('/') {
        return Err(Error::bad_request("prefix must start with /").into());
    }
    let cluster = cx.cluster().await?;
    let vault = cx.vault().await?;
    let root = issue_client_cert(cx, &vault, ETCD_ROOT_USER, "10m").await?;
    let tls = EtcdTls {
        ca_pem: root.ca_certificate,
        cert_pem: root.certificate,
        key_pem: root.private_key,
    };
    let etcd = EtcdClient::connect(&endpoints(&cluster), Some(tls), ETCD_TIMEOUT).await?;
    etcd.user_add(name).await?;
    etcd.grant_prefix(name, prefix).await
}

/// URL of the backup sidecar through the apiserver service proxy.
pub fn backup_url(apiserver: &str, name: Option<&str>) -> String {
    let base = format!("https://{apiserver}:{APISERVER_PORT}/api/v1/namespaces/{BACKUP_SERVICE}/proxy/api/v1/backup");
    match name {
        Some(n) => format!("{base}/{n}"),
        None => base,
    }
}

/// HTTP client authenticated as the cluster admin, plus the CP address to use.
async fn backup_client(cx: &CliContext) -> Result<(reqwest::Client, String)> {
    let cluster = cx.cluster().await?;
    let cp = control_plane(&cluster)?.address.clone();
    let vault = cx.vault().await?;
    let (ca_pem, issued) = cx.admin_cert(&vault, "10m").await?;
    let identity = reqwest::Identity::from_pem(format!("{}\n{}", issued.certificate, issued.private_key).as_bytes())
        .context("load admin identity")?;
    let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes()).context("parse kubernetes CA")?;
    let http = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .identity(identity)
        .timeout(Duration::from_secs(300))
        .build()
        .context("build backup client")?;
    Ok((http, cp))
}

async fn checked(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    bail!("etcd backup: HTTP {status}: {}", text.trim())
}

/// Snapshot names held by the backup sidecar.
pub async fn backup_list(cx: &CliContext) -> Result<Vec<String>> {
    let (http, cp) = backup_client(cx).await?;
    let resp = http
        .get(backup_url(&cp, None))
        .send()
        .await
        .context("etcd backup list")?;
    checked(resp).await?.json().await.context("decode backup list")
}

/// Download snapshot `name` into the current directory.
pub async fn backup_get(cx: &CliContext, name: &str) -> Result<std::path::PathBuf> {
    if !is_snapshot_name(name) {
        return Err(Error::bad_request(format!("invalid snapshot name: {name}")).into());
    }
    let (http, cp) = backup_client(cx).await?;
    let resp = http
        .get(backup_url(&cp, Some(name)))
        .send()
        .await
        .with_context(|| format!("etcd backup get {name}"))?;
    let body = checked(resp).await?.bytes().await.context("read snapshot")?;
    let path = std::path::PathBuf::from(name);
    std::fs::write(&path, &body).with_context(|| format!("Failed to write {name}"))?;
    Ok(path)
}
