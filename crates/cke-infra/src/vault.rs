use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::ca::CaName;
use cke_core::vault::VaultConfig;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Key-value path holding SSH private keys keyed by node address.
pub const SSH_KEYS_PATH: &str = "cke/ssh";
/// Key-value path holding the service account signing key.
pub const SERVICE_ACCOUNT_PATH: &str = "cke/service-account";
/// Key-value path holding the Secret encryption configuration.
pub const ENCRYPTION_KEY_PATH: &str = "cke/k8s-secret";

/// Default issuing role.
pub const ISSUE_ROLE: &str = "system";
/// Issuing role whose certificates belong to `system:masters`.
pub const ADMIN_ROLE: &str = "admin";
/// Issuing role whose certificates belong to `system:nodes`.
pub const NODE_ROLE: &str = "node";

const ROLES: &[(&str, &str)] = &[(ISSUE_ROLE, ""), (ADMIN_ROLE, "system:masters"), (NODE_ROLE, "system:nodes")];
const CA_TTL: &str = "876000h";

/// A certificate to issue from one of the CAs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertRequest {
    pub common_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", serialize_with = "join_comma")]
    pub alt_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", serialize_with = "join_comma")]
    pub ip_sans: Vec<String>,
    pub ttl: String,
    pub exclude_cn_from_sans: bool,
    /// Issuing role; empty means [`ISSUE_ROLE`].
    #[serde(skip)]
    pub role: String,
}

fn join_comma<S: serde::Serializer>(v: &[String], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&v.join(","))
}

impl CertRequest {
    pub fn new(common_name: impl Into<String>, ttl: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ttl: ttl.into(),
            ..Default::default()
        }
    }

    pub fn with_alt_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.alt_names.extend(names);
        self
    }

    pub fn with_ip_sans(mut self, ips: impl IntoIterator<Item = String>) -> Self {
        self.ip_sans.extend(ips);
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn role(&self) -> &str {
        if self.role.is_empty() { ISSUE_ROLE } else { &self.role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedCert {
    pub certificate: String,
    pub private_key: String,
    pub issuing_ca: String,
}

/// Certificate issuance and key material from the secret store.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    async fn issue(&self, ca: CaName, req: &CertRequest) -> Result<IssuedCert>;
    /// SSH private keys by node address; the empty key is the default.
    async fn ssh_keys(&self) -> Result<BTreeMap<String, String>>;
    /// PEM private key that signs service account tokens.
    async fn service_account_key(&self) -> Result<String>;
    /// Base64 AES key for Secret encryption, if configured.
    async fn encryption_key(&self) -> Result<Option<String>>;
}

/// Minimal Vault HTTP client.
pub struct VaultClient {
    http: reqwest::Client,
    endpoint: String,
    approle: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl VaultClient {
    fn build_http(ca_cert: &str) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if !ca_cert.is_empty() {
            let ca = reqwest::Certificate::from_pem(ca_cert.as_bytes()).context("parse vault CA certificate")?;
            builder = builder.add_root_certificate(ca);
        }
        builder.build().context("build vault http client")
    }

    /// Client that logs in with the AppRole credentials of `cfg` on first use.
    pub fn from_config(cfg: &VaultConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            http: Self::build_http(&cfg.ca_cert)?,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            approle: Some((cfg.role_id.clone(), cfg.secret_id.clone())),
            token: RwLock::new(None),
        })
    }

    /// Client using an existing token, as given by `VAULT_TOKEN`.
    pub fn with_token(endpoint: &str, ca_cert: &str, token: &str) -> Result<Self> {
        Ok(Self {
            http: Self::build_http(ca_cert)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            approle: None,
            token: RwLock::new(Some(token.to_string())),
        })
    }

    async fn token(&self) -> Result<String> {
        if let Some(t) = self.token.read().await.as_ref() {
            return Ok(t.clone());
        }
        let mut guard = self.token.write().await;
        if let Some(t) = guard.as_ref() {
            return Ok(t.clone());
        }
        let Some((role_id, secret_id)) = &self.approle else {
            bail!("vault token is not set");
        };
        let resp = self
            .http
            .post(format!("{}/v1/auth/approle/login", self.endpoint))
            .json(&json!({"role_id": role_id, "secret_id": secret_id}))
            .send()
            .await
            .map_err(|e| Error::transient(format!("vault login: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::fatal(format!("vault login: HTTP {}", resp.status())).into());
        }
        let body: Value = resp.json().await.context("decode vault login")?;
        let token = body["auth"]["client_token"]
            .as_str()
            .context("vault login returned no token")?
            .to_string();
        debug!("logged in to vault");
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Issue a request under `/v1/<path>`; `None` for 404 and empty bodies.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let token = self.token().await?;
        let mut req = self
            .http
            .request(method.clone(), format!("{}/v1/{}", self.endpoint, path))
            .header("X-Vault-Token", token);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::transient(format!("vault {method} {path}: {e}")))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::fatal(format!("vault {method} {path}: HTTP {status}: {}", text.trim())).into());
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        let v = serde_json::from_str(&text).with_context(|| format!("decode vault {path}"))?;
        Ok(Some(v))
    }

    /// The `data` object at `path`.
    pub async fn read(&self, path: &str) -> Result<Option<Value>> {
        Ok(self
            .request(Method::GET, path, None)
            .await?
            .and_then(|mut v| v.get_mut("data").map(Value::take)))
    }

    pub async fn write(&self, path: &str, body: &Value) -> Result<Option<Value>> {
        Ok(self
            .request(Method::POST, path, Some(body))
            .await?
            .and_then(|mut v| v.get_mut("data").map(Value::take)))
    }

    async fn read_string(&self, path: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .read(path)
            .await?
            .and_then(|d| d[field].as_str().map(str::to_string)))
    }

    /// Random bytes from the secret store, base64 encoded.
    pub async fn random_base64(&self, bytes: usize) -> Result<String> {
        let data = self
            .write(&format!("sys/tools/random/{bytes}"), &json!({"format": "base64"}))
            .await?
            .context("vault random returned no data")?;
        Ok(data["random_bytes"]
            .as_str()
            .context("vault random returned no bytes")?
            .to_string())
    }

    /// Store the SSH private key for `address` (empty for the default key).
    pub async fn put_ssh_key(&self, address: &str, pem: &str) -> Result<()> {
        let mut keys = self.ssh_keys().await?;
        keys.insert(address.to_string(), pem.to_string());
        self.write(SSH_KEYS_PATH, &serde_json::to_value(&keys)?).await?;
        Ok(())
    }

    /// Generate the Secret encryption key unless it exists.
    pub async fn ensure_encryption_key(&self) -> Result<bool> {
        if self.encryption_key().await?.is_some() {
            return Ok(false);
        }
        let key = self.random_base64(32).await?;
        self.write(ENCRYPTION_KEY_PATH, &json!({"key": key})).await?;
        Ok(true)
    }

    /// Create the PKI mounts, issuing role and key-value mount, then an AppRole
    /// for CKE itself. Returns the CA certificates and the AppRole credentials.
    pub async fn init(&self, cluster_name: &str) -> Result<(Vec<(CaName, String)>, String, String)> {
        let mut cas = Vec::new();
        for &ca in CaName::ALL {
            let mount = ca.vault_mount();
            let mounted = self.read(&format!("sys/mounts/{mount}/tune")).await.ok().flatten().is_some();
            if !mounted {
                self.write(
                    &format!("sys/mounts/{mount}"),
                    &json!({"type": "pki", "config": {"max_lease_ttl": CA_TTL}}),
                )
                .await?;
                info!(ca = %ca, "mounted PKI");
            }
            let pem = match self.read_string(&format!("{mount}/cert/ca"), "certificate").await? {
                Some(pem) if !pem.is_empty() => pem,
                _ => {
                    let cn = format!("{cluster_name} {ca} CA");
                    let data = self
                        .write(
                            &format!("{mount}/root/generate/internal"),
                            &json!({"common_name": cn, "ttl": CA_TTL, "format": "pem"}),
                        )
                        .await?
                        .context("root CA generation returned no data")?;
                    data["certificate"]
                        .as_str()
                        .context("root CA generation returned no certificate")?
                        .to_string()
                }
            };
            for (role, org) in ROLES {
                self.write(
                    &format!("{mount}/roles/{role}"),
                    &json!({
                        "ttl": "87600h",
                        "max_ttl": "87600h",
                        "enforce_hostnames": false,
                        "allow_any_name": true,
                        "allow_ip_sans": true,
                        "organization": org,
                    }),
                )
                .await?;
            }
            cas.push((ca, pem));
        }

        if self.read("sys/mounts/cke/tune").await.ok().flatten().is_none() {
            self.write("sys/mounts/cke", &json!({"type": "kv", "options": {"version": "1"}}))
                .await?;
        }
        if self.service_account_key().await.is_err() {
            let issued = self
                .issue(CaName::Kubernetes, &CertRequest::new("service-account", "87600h"))
                .await?;
            self.write(SERVICE_ACCOUNT_PATH, &json!({"key": issued.private_key}))
                .await?;
        }

        let policy = r#"path "cke/*" { capabilities = ["create", "read", "update", "delete", "list", "sudo"] }"#;
        self.request(Method::PUT, "sys/policies/acl/cke", Some(&json!({"policy": policy})))
            .await?;
        if self.read("sys/auth/approle/tune").await.ok().flatten().is_none() {
            self.write("sys/auth/approle", &json!({"type": "approle"})).await?;
        }
        self.write(
            "auth/approle/role/cke",
            &json!({"policies": "cke", "period": "1h"}),
        )
        .await?;
        let role_id = self
            .read_string("auth/approle/role/cke/role-id", "role_id")
            .await?
            .context("approle has no role_id")?;
        let secret = self
            .write("auth/approle/role/cke/secret-id", &json!({}))
            .await?
            .context("approle returned no secret_id")?;
        let secret_id = secret["secret_id"]
            .as_str()
            .context("approle returned no secret_id")?
            .to_string();
        Ok((cas, role_id, secret_id))
    }
}

#[async_trait]
impl CertIssuer for VaultClient {
    async fn issue(&self, ca: CaName, req: &CertRequest) -> Result<IssuedCert> {
        let path = format!("{}/issue/{}", ca.vault_mount(), req.role());
        let data = self
            .write(&path, &serde_json::to_value(req)?)
            .await
            .with_context(|| format!("issue {} from {ca}", req.common_name))?
            .ok_or_else(|| Error::fatal(format!("CA {ca} is not initialized")))?;
        serde_json::from_value(data).with_context(|| format!("decode certificate from {ca}"))
    }

    async fn ssh_keys(&self) -> Result<BTreeMap<String, String>> {
        let Some(data) = self.read(SSH_KEYS_PATH).await? else {
            return Ok(BTreeMap::new());
        };
        serde_json::from_value(data).context("decode ssh keys")
    }

    async fn service_account_key(&self) -> Result<String> {
        self.read_string(SERVICE_ACCOUNT_PATH, "key")
            .await?
            .ok_or_else(|| Error::NotFound.into())
    }

    async fn encryption_key(&self) -> Result<Option<String>> {
        self.read_string(ENCRYPTION_KEY_PATH, "key").await
    }
}
