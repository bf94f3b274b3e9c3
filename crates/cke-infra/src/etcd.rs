use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use etcd_client::{
    Certificate, Client, ConnectOptions, Identity, Member, Permission, TlsOptions, UserAddOptions,
};

/// Client port of the managed etcd.
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// Peer port of the managed etcd.
pub const ETCD_PEER_PORT: u16 = 2380;

pub fn client_url(addr: &str) -> String {
    format!("https://{addr}:{ETCD_CLIENT_PORT}")
}

pub fn peer_url(addr: &str) -> String {
    format!("https://{addr}:{ETCD_PEER_PORT}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMemberInfo {
    pub id: u64,
    /// Empty until the member has started once.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

impl From<&Member> for EtcdMemberInfo {
    fn from(m: &Member) -> Self {
        Self {
            id: m.id(),
            name: m.name().to_string(),
            peer_urls: m.peer_urls().to_vec(),
            client_urls: m.client_urls().to_vec(),
        }
    }
}

/// Raft progress reported by one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStatus {
    pub member_id: u64,
    pub leader: u64,
    pub raft_index: u64,
    pub raft_applied_index: u64,
}

/// Client credentials for the managed etcd.
#[derive(Clone)]
pub struct EtcdTls {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Operations on the managed etcd cluster.
#[async_trait]
pub trait EtcdApi: Send + Sync {
    async fn member_list(&self) -> Result<Vec<EtcdMemberInfo>>;
    async fn member_add(&self, peer_url: &str) -> Result<EtcdMemberInfo>;
    async fn member_remove(&self, id: u64) -> Result<()>;
    async fn status(&self, endpoint: &str) -> Result<EndpointStatus>;
    /// True when a linearizable read on `endpoint` succeeds.
    async fn health(&self, endpoint: &str) -> Result<bool>;
    async fn user_add(&self, name: &str) -> Result<()>;
    /// Give `user` read-write access to keys under `prefix`.
    async fn grant_prefix(&self, user: &str, prefix: &str) -> Result<()>;
}

/// [`EtcdApi`] backed by etcd-client.
pub struct EtcdClient {
    client: Client,
    tls: Option<EtcdTls>,
    timeout: Duration,
}

fn connect_options(tls: Option<&EtcdTls>, timeout: Duration) -> ConnectOptions {
    let mut opts = ConnectOptions::new()
        .with_connect_timeout(timeout)
        .with_timeout(timeout);
    if let Some(t) = tls {
        opts = opts.with_tls(
            TlsOptions::new()
                .ca_certificate(Certificate::from_pem(&t.ca_pem))
                .identity(Identity::from_pem(&t.cert_pem, &t.key_pem)),
        );
    }
    opts
}

async fn deadline<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, etcd_client::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(Error::transient(format!("etcd {what}: {e}")).into()),
        Err(_) => Err(Error::transient(format!("etcd {what}: timed out")).into()),
    }
}

fn already_exists(e: &anyhow::Error) -> bool {
    format!("{e:#}").contains("already exists")
}

impl EtcdClient {
    pub async fn connect(endpoints: &[String], tls: Option<EtcdTls>, timeout: Duration) -> Result<Self> {
        let client = Client::connect(endpoints, Some(connect_options(tls.as_ref(), timeout)))
            .await
            .map_err(|e| Error::transient(format!("connect etcd {endpoints:?}: {e}")))?;
        Ok(Self { client, tls, timeout })
    }

    async fn single(&self, endpoint: &str) -> Result<Client> {
        Client::connect([endpoint], Some(connect_options(self.tls.as_ref(), self.timeout)))
            .await
            .map_err(|e| Error::transient(format!("connect etcd {endpoint}: {e}")).into())
    }
}

#[async_trait]
impl EtcdApi for EtcdClient {
    async fn member_list(&self) -> Result<Vec<EtcdMemberInfo>> {
        let mut c = self.client.clone();
        let resp = deadline(self.timeout, "member list", c.member_list()).await?;
        Ok(resp.members().iter().map(EtcdMemberInfo::from).collect())
    }

    async fn member_add(&self, peer_url: &str) -> Result<EtcdMemberInfo> {
        let mut c = self.client.clone();
        let resp = deadline(self.timeout, "member add", c.member_add([peer_url], None)).await?;
        let member = resp
            .member()
            .with_context(|| format!("member add {peer_url} returned no member"))?;
        Ok(member.into())
    }

    async fn member_remove(&self, id: u64) -> Result<()> {
        let mut c = self.client.clone();
        deadline(self.timeout, "member remove", c.member_remove(id)).await?;
        Ok(())
    }

    async fn status(&self, endpoint: &str) -> Result<EndpointStatus> {
        let mut c = self.single(endpoint).await?;
        let resp = deadline(self.timeout, "status", c.status()).await?;
        Ok(EndpointStatus {
            member_id: resp.header().map(|h| h.member_id()).unwrap_or_default(),
            leader: resp.leader(),
            raft_index: resp.raft_index(),
            raft_applied_index: resp.raft_applied_index(),
        })
    }

    async fn health(&self, endpoint: &str) -> Result<bool> {
        let mut c = self.single(endpoint).await?;
        match deadline(self.timeout, "health", c.get("health", None)).await {
            Ok(_) => Ok(true),
            // The key may be unreadable for our user; the read still went through raft.
            Err(e) if format!("{e:#}").contains("permission denied") => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn user_add(&self, name: &str) -> Result<()> {
        let mut c = self.client.clone();
        let opts = UserAddOptions::new().with_no_pwd();
        match deadline(self.timeout, "user add", c.user_add(name, "", Some(opts))).await {
            Ok(_) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn grant_prefix(&self, user: &str, prefix: &str) -> Result<()> {
        let mut c = self.client.clone();
        match deadline(self.timeout, "role add", c.role_add(user)).await {
            Ok(_) => {}
            Err(e) if already_exists(&e) => {}
            Err(e) => return Err(e),
        }
        let perm = Permission::read_write(prefix).with_prefix();
        deadline(self.timeout, "grant permission", c.role_grant_permission(user, perm)).await?;
        deadline(self.timeout, "grant role", c.user_grant_role(user, user)).await?;
        Ok(())
    }
}

/// Whether a member with `status` keeps up with the leader.
pub fn is_in_sync(leader: &EndpointStatus, member: &EndpointStatus, healthy: bool) -> bool {
    const TOLERANCE: u64 = 100;
    healthy && leader.raft_index.saturating_sub(member.raft_applied_index) <= TOLERANCE
}

/// Address part of an etcd URL such as `https://10.0.0.1:2380`.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host = rest.rsplit_once(':').map_or(rest, |(h, _)| h);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        assert_eq!(client_url("10.0.0.1"), "https://10.0.0.1:2379");
        assert_eq!(peer_url("10.0.0.1"), "https://10.0.0.1:2380");
        assert_eq!(url_host("https://10.0.0.1:2380"), Some("10.0.0.1"));
        assert_eq!(url_host("http://[fd00::1]:2379"), Some("fd00::1"));
        assert_eq!(url_host("https://:2379"), None);
    }

    #[test]
    fn test_in_sync_tolerance() {
        let leader = EndpointStatus {
            raft_index: 1000,
            ..Default::default()
        };
        let close = EndpointStatus {
            raft_applied_index: 900,
            ..Default::default()
        };
        let far = EndpointStatus {
            raft_applied_index: 899,
            ..Default::default()
        };
        assert!(is_in_sync(&leader, &close, true));
        assert!(!is_in_sync(&leader, &close, false));
        assert!(!is_in_sync(&leader, &far, true));
    }
}
