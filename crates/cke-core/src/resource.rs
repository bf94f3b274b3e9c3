//! Kubernetes resources managed by the engine.
//!
//! Definitions are stored as JSON under `resource/<key>`, where the key is
//! `Kind/namespace/name` for namespaced objects and `Kind/name` otherwise.
//! The storage modification revision of the key is the definition's revision.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::status::ResourceStatus;

pub const ANNOTATION_REVISION: &str = "cke.cybozu.com/revision";
pub const ANNOTATION_IMAGE: &str = "cke.cybozu.com/image";
pub const ANNOTATION_INJECT_CACERT: &str = "cke.cybozu.com/inject-cacert";
pub const ANNOTATION_ISSUE_CERT: &str = "cke.cybozu.com/issue-cert";
/// Value is the etcd user the Secret's client certificate authenticates as.
pub const ANNOTATION_ISSUE_ETCD_CLIENT: &str = "cke.cybozu.com/issue-etcd-client";

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "cke";

const RANK_OTHER_CLUSTER: u32 = 1000;
const RANK_OTHER_NAMESPACED: u32 = 3000;

/// Application rank of `kind`; lower ranks are applied first.
pub fn rank_of(kind: &str, namespaced: bool) -> u32 {
    match kind {
        "Namespace" => 10,
        "ServiceAccount" => 20,
        "CustomResourceDefinition" => 30,
        "ClusterRole" => 40,
        "ClusterRoleBinding" => 50,
        "Role" => 2010,
        "RoleBinding" => 2020,
        "NetworkPolicy" => 2030,
        "Secret" => 2040,
        "ConfigMap" => 2050,
        _ if namespaced => RANK_OTHER_NAMESPACED,
        _ => RANK_OTHER_CLUSTER,
    }
}

#[derive(Deserialize)]
struct Head {
    #[serde(rename = "apiVersion", default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: HeadMeta,
}

#[derive(Deserialize, Default)]
struct HeadMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

/// A user-defined or engine-owned Kubernetes object.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub key: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub revision: i64,
    /// Image the object references, compared against the image annotation.
    pub image: String,
    pub rank: u32,
    pub definition: Value,
}

impl ResourceDefinition {
    /// Build a definition from an object; the revision is filled in by storage.
    pub fn from_value(definition: Value) -> Result<Self> {
        let head: Head = serde_json::from_value(definition.clone()).context("Failed to read object header")?;
        if head.api_version.is_empty() || head.kind.is_empty() || head.metadata.name.is_empty() {
            return Err(Error::bad_request("resource needs apiVersion, kind and metadata.name").into());
        }
        let namespace = head.metadata.namespace.unwrap_or_default();
        let namespaced = !namespace.is_empty();
        if !namespaced && requires_namespace(&head.kind) {
            return Err(Error::bad_request(format!(
                "{} {} must have metadata.namespace",
                head.kind, head.metadata.name
            ))
            .into());
        }
        let key = resource_key(&head.kind, &namespace, &head.metadata.name);
        Ok(Self {
            key,
            rank: rank_of(&head.kind, namespaced),
            image: head
                .metadata
                .annotations
                .get(ANNOTATION_IMAGE)
                .cloned()
                .unwrap_or_default(),
            api_version: head.api_version,
            kind: head.kind,
            namespace,
            name: head.metadata.name,
            revision: 0,
            definition,
        })
    }

    /// Rebuild a stored definition.
    pub fn from_stored(json: &[u8], revision: i64) -> Result<Self> {
        let value: Value = serde_json::from_slice(json).context("Failed to parse stored resource")?;
        let mut def = Self::from_value(value)?;
        def.revision = revision;
        Ok(def)
    }

    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// True iff the object on the server is missing or older than this definition.
    pub fn need_update(&self, status: Option<&ResourceStatus>) -> bool {
        let Some(rs) = status else {
            return true;
        };
        if rs.annotations.get(ANNOTATION_REVISION) != Some(&self.revision.to_string()) {
            return true;
        }
        !self.image.is_empty() && rs.annotations.get(ANNOTATION_IMAGE) != Some(&self.image)
    }

    /// The object to apply, carrying the revision annotation.
    pub fn applied_body(&self) -> Value {
        let mut body = self.definition.clone();
        set_annotation(&mut body, ANNOTATION_REVISION, &self.revision.to_string());
        body
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.definition
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
    }
}

fn requires_namespace(kind: &str) -> bool {
    matches!(
        kind,
        "ServiceAccount" | "Role" | "RoleBinding" | "NetworkPolicy" | "Secret" | "ConfigMap"
    )
}

pub fn resource_key(kind: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{kind}/{name}")
    } else {
        format!("{kind}/{namespace}/{name}")
    }
}

/// Order by rank, then by key.
pub fn compare(a: &ResourceDefinition, b: &ResourceDefinition) -> Ordering {
    a.rank.cmp(&b.rank).then_with(|| a.key.cmp(&b.key))
}

pub fn sort_resources(defs: &mut [ResourceDefinition]) {
    defs.sort_by(compare);
}

/// Parse a multi-document YAML (or JSON) file into definitions.
pub fn parse_resources(data: &str) -> Result<Vec<ResourceDefinition>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(data).enumerate() {
        let value = Value::deserialize(doc).with_context(|| format!("document {i}"))?;
        if value.is_null() {
            continue;
        }
        out.push(ResourceDefinition::from_value(value).with_context(|| format!("document {i}"))?);
    }
    Ok(out)
}

fn set_annotation(body: &mut Value, name: &str, value: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let meta = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    let annotations = meta
        .entry("annotations")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(a) = annotations.as_object_mut() {
        a.insert(name.to_string(), Value::String(value.to_string()));
    }
}

/// Fill `caBundle` of every webhook (or of a CRD conversion webhook) with `ca_pem`.
pub fn inject_ca_bundle(body: &mut Value, ca_pem: &str) {
    let bundle = Value::String(base64::engine::general_purpose::STANDARD.encode(ca_pem));
    if let Some(webhooks) = body.get_mut("webhooks").and_then(Value::as_array_mut) {
        for w in webhooks {
            if let Some(cc) = w.get_mut("clientConfig").and_then(Value::as_object_mut) {
                cc.insert("caBundle".into(), bundle.clone());
            }
        }
    }
    if let Some(cc) = body
        .pointer_mut("/spec/conversion/webhook/clientConfig")
        .and_then(Value::as_object_mut)
    {
        cc.insert("caBundle".into(), bundle);
    }
}

/// Store an issued certificate in a `kubernetes.io/tls` Secret body.
pub fn fill_tls_secret(body: &mut Value, cert_pem: &str, key_pem: &str, ca_pem: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    obj.insert("type".into(), Value::String("kubernetes.io/tls".into()));
    let enc = |s: &str| Value::String(base64::engine::general_purpose::STANDARD.encode(s));
    let mut data = serde_json::Map::new();
    data.insert("tls.crt".into(), enc(cert_pem));
    data.insert("tls.key".into(), enc(key_pem));
    data.insert("ca.crt".into(), enc(ca_pem));
    obj.insert("data".into(), Value::Object(data));
}
