use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::config::CkeConfig;
use cke_core::constraints::Constraints;
use cke_core::node::Node;
use cke_core::{Error, is_not_found};
use cke_infra::kubeconfig;
use cke_infra::vault::{ADMIN_ROLE, CertRequest, IssuedCert, VaultClient};
use cke_storage::{EtcdKv, Storage};

/// Connected storage plus the loaded configuration.
pub struct CliContext {
    pub config: CkeConfig,
    pub storage: Storage,
}

impl CliContext {
    pub async fn connect(config: CkeConfig) -> Result<Self> {
        let kv = EtcdKv::connect(&config.etcd).await?;
        let storage = Storage::new(Arc::new(kv), &config.etcd.prefix);
        Ok(Self { config, storage })
    }

    pub fn with_storage(config: CkeConfig, storage: Storage) -> Self {
        Self { config, storage }
    }

    pub async fn cluster(&self) -> Result<Cluster> {
        self.storage
            .get_cluster()
            .await
            .context("cluster is not configured; run `ckecli cluster set`")
    }

    /// Stored constraints, or the defaults when none were set.
    pub async fn constraints(&self) -> Result<Constraints> {
        match self.storage.get_constraints().await {
            Ok(c) => Ok(c),
            Err(e) if is_not_found(&e) => Ok(Constraints::default()),
            Err(e) => Err(e),
        }
    }

    /// Vault client logging in with the stored AppRole.
    pub async fn vault(&self) -> Result<VaultClient> {
        let cfg = self
            .storage
            .get_vault_config()
            .await
            .context("vault is not configured; run `ckecli vault config`")?;
        VaultClient::from_config(&cfg)
    }

    /// Issue an admin client certificate for the apiserver.
    pub async fn admin_cert(&self, vault: &VaultClient, ttl: &str) -> Result<(String, IssuedCert)> {
        use cke_infra::CertIssuer;
        check_ttl(ttl)?;
        let ca_pem = self
            .storage
            .get_ca_certificate(CaName::Kubernetes)
            .await
            .context("load kubernetes CA")?;
        let issued = vault
            .issue(CaName::Kubernetes, &CertRequest::new("admin", ttl).with_role(ADMIN_ROLE))
            .await
            .context("issue admin certificate")?;
        Ok((ca_pem, issued))
    }

    /// Admin kubeconfig pointing at the first control plane.
    pub async fn admin_kubeconfig(&self, ttl: &str) -> Result<String> {
        let cluster = self.cluster().await?;
        let cp = control_plane(&cluster)?;
        let vault = self.vault().await?;
        let (ca_pem, issued) = self.admin_cert(&vault, ttl).await?;
        kubeconfig::render(
            &cluster.name,
            &kubeconfig::apiserver_url(&cp.address),
            "admin",
            &ca_pem,
            &issued.certificate,
            &issued.private_key,
        )
    }
}

/// Accept durations like `2h`, `30m` or `1h30m`.
pub fn check_ttl(ttl: &str) -> Result<()> {
    let re = regex::Regex::new(r"^([0-9]+(h|m|s))+$").context("TTL pattern")?;
    if !re.is_match(ttl) {
        return Err(Error::bad_request(format!("invalid TTL {ttl:?}; use forms like 2h or 1h30m")).into());
    }
    Ok(())
}

pub fn control_plane(cluster: &Cluster) -> Result<&Node> {
    match cluster.control_planes().next() {
        Some(n) => Ok(n),
        None => bail!("cluster has no control plane node"),
    }
}

/// Resolve a node by address or by node name.
pub fn find_node<'a>(cluster: &'a Cluster, name: &str) -> Result<&'a Node> {
    cluster
        .node(name)
        .or_else(|| cluster.node_by_name(name))
        .ok_or_else(|| Error::bad_request(format!("node {name} is not in the cluster")).into())
}

/// Split `user@node` into its parts.
pub fn split_user(target: &str) -> (Option<&str>, &str) {
    match target.split_once('@') {
        Some((user, node)) if !user.is_empty() => (Some(user), node),
        Some((_, node)) => (None, node),
        None => (None, target),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cke_storage::MemoryKv;

    pub(crate) fn cluster() -> Cluster {
        Cluster::from_yaml(
            r#"
name: test
service_subnet: 10.68.0.0/16
nodes:
  - address: 10.0.0.11
    hostname: cp1
    user: cybozu
    control_plane: true
  - address: 10.0.0.21
    user: cybozu
"#,
        )
        .unwrap()
    }

    pub(crate) fn ctx() -> CliContext {
        let storage = Storage::new(Arc::new(MemoryKv::new()), "/cke/");
        CliContext::with_storage(CkeConfig::default(), storage)
    }

    #[test]
    fn test_ttl() {
        for ok in ["2h", "30m", "1h30m", "90s"] {
            check_ttl(ok).unwrap();
        }
        for bad in ["", "2", "h", "2d", "-1h"] {
            assert!(check_ttl(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_find_node() {
        let c = cluster();
        assert_eq!(find_node(&c, "cp1").unwrap().address, "10.0.0.11");
        assert_eq!(find_node(&c, "10.0.0.21").unwrap().address, "10.0.0.21");
        let err = find_node(&c, "nope").unwrap_err();
        assert!(err.to_string().contains("not in the cluster"));
        assert_eq!(control_plane(&c).unwrap().address, "10.0.0.11");
    }

    #[test]
    fn test_split_user() {
        assert_eq!(split_user("root@cp1"), (Some("root"), "cp1"));
        assert_eq!(split_user("@cp1"), (None, "cp1"));
        assert_eq!(split_user("cp1"), (None, "cp1"));
    }

    #[tokio::test]
    async fn test_missing_cluster_and_vault() {
        let cx = ctx();
        let err = cx.cluster().await.unwrap_err();
        assert!(format!("{err:#}").contains("cluster set"));
        assert!(cx.vault().await.is_err());
        assert_eq!(cx.constraints().await.unwrap(), Constraints::default());
    }
}
