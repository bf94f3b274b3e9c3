use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Connection settings of the secret store, kept under the `vault` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub endpoint: String,
    #[serde(default, rename = "ca-cert", skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
    #[serde(rename = "role-id")]
    pub role_id: String,
    #[serde(rename = "secret-id")]
    pub secret_id: String,
}

impl VaultConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let cfg: Self = serde_json::from_slice(data).context("Failed to parse vault config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(Error::bad_request(format!("invalid vault endpoint: {:?}", self.endpoint)).into());
        }
        if self.role_id.is_empty() || self.secret_id.is_empty() {
            return Err(Error::bad_request("vault role-id and secret-id are required").into());
        }
        Ok(())
    }
}
