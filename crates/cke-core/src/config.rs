use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cke/config.toml";

/// Top-level configuration shared by the `cke` daemon and `ckecli`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CkeConfig {
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection to the etcd cluster that stores CKE's own state.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Key prefix; always ends with `/`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Control-loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Fixed-interval backoff between reconciliation passes (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// TTL of the leader lease (seconds).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: SocketAddr,
    /// Operation records kept in storage.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_prefix() -> String {
    "/cke/".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_interval() -> u64 {
    60
}
fn default_session_ttl() -> u64 {
    60
}
fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 10180))
}
fn default_max_records() -> usize {
    1000
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            prefix: default_prefix(),
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            username: None,
            password: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            session_ttl_secs: default_session_ttl(),
            metrics_listen: default_metrics_listen(),
            max_records: default_max_records(),
        }
    }
}

impl EtcdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl CkeConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cke config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(s).with_context(|| "Failed to parse cke config TOML")?;
        if !config.etcd.prefix.ends_with('/') {
            config.etcd.prefix.push('/');
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.etcd.endpoints.is_empty() {
            anyhow::bail!("[etcd] endpoints must not be empty");
        }
        if !self.etcd.prefix.starts_with('/') {
            anyhow::bail!("[etcd] prefix must start with '/': {}", self.etcd.prefix);
        }
        if self.etcd.tls_cert_file.is_some() != self.etcd.tls_key_file.is_some() {
            anyhow::bail!("[etcd] tls_cert_file and tls_key_file must be set together");
        }
        if self.etcd.username.is_some() != self.etcd.password.is_some() {
            anyhow::bail!("[etcd] username and password must be set together");
        }
        if self.server.interval_secs == 0 {
            anyhow::bail!("[server] interval_secs must be positive");
        }
        if self.server.session_ttl_secs < 5 {
            anyhow::bail!("[server] session_ttl_secs must be at least 5");
        }
        if self.server.max_records == 0 {
            anyhow::bail!("[server] max_records must be positive");
        }
        Ok(())
    }
}
