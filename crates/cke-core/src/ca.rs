use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Certificate authorities whose certificates are kept in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaName {
    Server,
    EtcdPeer,
    EtcdClient,
    Kubernetes,
    KubernetesAggregation,
    Webhook,
}

impl CaName {
    pub const ALL: &'static [CaName] = &[
        Self::Server,
        Self::EtcdPeer,
        Self::EtcdClient,
        Self::Kubernetes,
        Self::KubernetesAggregation,
        Self::Webhook,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::EtcdPeer => "etcd-peer",
            Self::EtcdClient => "etcd-client",
            Self::Kubernetes => "kubernetes",
            Self::KubernetesAggregation => "kubernetes-aggregation",
            Self::Webhook => "webhook",
        }
    }

    /// PKI mount of this CA in the secret store.
    pub fn vault_mount(self) -> String {
        format!("cke/ca-{}", self.as_str())
    }
}

impl fmt::Display for CaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::bad_request(format!("unknown CA name: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all() {
        for ca in CaName::ALL {
            assert_eq!(ca.as_str().parse::<CaName>().unwrap(), *ca);
        }
        assert!("root".parse::<CaName>().is_err());
    }

    #[test]
    fn test_vault_mount() {
        assert_eq!(CaName::EtcdPeer.vault_mount(), "cke/ca-etcd-peer");
    }
}
