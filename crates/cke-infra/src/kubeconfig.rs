use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

/// Port the apiserver listens on.
pub const APISERVER_PORT: u16 = 6443;
/// Port rivers listens on for the local apiserver front door.
pub const RIVERS_PORT: u16 = 16443;

pub fn apiserver_url(addr: &str) -> String {
    format!("https://{addr}:{APISERVER_PORT}")
}

/// URL every node component uses to reach the apiserver.
pub fn local_apiserver_url() -> String {
    format!("https://127.0.0.1:{RIVERS_PORT}")
}

/// Render a kubeconfig with embedded client credentials.
pub fn render(cluster: &str, server: &str, user: &str, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<String> {
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(ca_pem),
            },
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": STANDARD.encode(cert_pem),
                "client-key-data": STANDARD.encode(key_pem),
            },
        }],
        "contexts": [{
            "name": "default",
            "context": { "cluster": cluster, "user": user },
        }],
        "current-context": "default",
    });
    serde_yaml::to_string(&doc).context("render kubeconfig")
}
