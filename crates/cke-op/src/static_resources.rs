//! Kubernetes objects owned by the engine: cluster DNS, node-local DNS and
//! the etcd backup service.
//!
//! They are rendered from the cluster declaration on every pass and applied
//! through the same path as user resources. A definition's revision is
//! derived from its rendered content, so any change to the declaration that
//! alters an object makes that object outdated.

use anyhow::{Context, Result};
use cke_core::cluster::Cluster;
use cke_core::images::Image;
use cke_core::resource::{ANNOTATION_IMAGE, ANNOTATION_ISSUE_ETCD_CLIENT, ResourceDefinition};
use cke_infra::etcd::client_url;
use cke_infra::infra::ETCD_ROOT_USER;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::maintain::SYSTEM_NAMESPACE;

pub const CLUSTER_DNS_NAME: &str = "cluster-dns";
pub const CLUSTER_DNS_SERVICE_ACCOUNT: &str = "cke-cluster-dns";
pub const NODE_DNS_NAME: &str = "node-dns";
pub const NODE_DNS_SERVICE_ACCOUNT: &str = "cke-node-dns";
pub const ETCD_BACKUP_NAME: &str = "etcdbackup";
pub const ETCD_BACKUP_PORT: u16 = 8080;

const CLUSTER_DNS_PORT: u16 = 1053;
const CLUSTER_DNS_REPLICAS: u32 = 2;
const ETCD_BACKUP_DIR: &str = "/etcdbackup";
const ETCD_BACKUP_SECRET_DIR: &str = "/etcd-secret";

/// Every engine-owned definition for `cluster`, in no particular order.
pub fn static_resources(cluster: &Cluster) -> Result<Vec<ResourceDefinition>> {
    let mut objects = cluster_dns_objects(cluster)?;
    objects.extend(node_dns_objects(cluster)?);
    if cluster.etcd_backup.enabled {
        objects.extend(etcd_backup_objects(cluster)?);
    }
    objects.into_iter().map(owned_definition).collect()
}

fn owned_definition(object: Value) -> Result<ResourceDefinition> {
    let rendered = serde_json::to_vec(&object).context("serialize static resource")?;
    let mut def = ResourceDefinition::from_value(object)?;
    def.revision = content_revision(&Sha256::digest(&rendered));
    Ok(def)
}

/// Positive revision taken from the leading bytes of a digest.
fn content_revision(digest: &[u8]) -> i64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head) & i64::MAX
}

fn metadata(name: &str) -> Value {
    json!({"name": name, "namespace": SYSTEM_NAMESPACE})
}

fn with_image(name: &str, image: Image) -> Value {
    json!({
        "name": name,
        "namespace": SYSTEM_NAMESPACE,
        "annotations": {ANNOTATION_IMAGE: image.name()},
    })
}

fn service_account(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": metadata(name)})
}

fn config_map(name: &str, key: &str, data: String) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(name),
        "data": {key: data},
    })
}

fn upstreams(cluster: &Cluster) -> String {
    if cluster.dns_servers.is_empty() {
        "/etc/resolv.conf".to_string()
    } else {
        cluster.dns_servers.join(" ")
    }
}

pub fn corefile(cluster: &Cluster) -> String {
    let domain = &cluster.options.kubelet.domain;
    let upstream = upstreams(cluster);
    format!(
        r#".:{CLUSTER_DNS_PORT} {{
    errors
    health :8080
    ready :8181
    log . {{
        class denial error
    }}
    kubernetes {domain} in-addr.arpa ip6.arpa {{
        pods verified
        fallthrough in-addr.arpa ip6.arpa
    }}
    prometheus :9153
    forward . {upstream}
    cache 30
    reload
    loadbalance
}}
"#
    )
}

fn cluster_dns_objects(cluster: &Cluster) -> Result<Vec<Value>> {
    let address = cluster.cluster_dns_address()?;
    let labels = json!({"k8s-app": CLUSTER_DNS_NAME});
    let http_check = |path: &str, port: u16| json!({"httpGet": {"path": path, "port": port}, "periodSeconds": 10});
    Ok(vec![
        service_account(CLUSTER_DNS_SERVICE_ACCOUNT),
        config_map(CLUSTER_DNS_NAME, "Corefile", corefile(cluster)),
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": with_image(CLUSTER_DNS_NAME, Image::CoreDns),
            "spec": {
                "replicas": CLUSTER_DNS_REPLICAS,
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "serviceAccountName": CLUSTER_DNS_SERVICE_ACCOUNT,
                        "priorityClassName": "system-cluster-critical",
                        "tolerations": [{"key": "CriticalAddonsOnly", "operator": "Exists"}],
                        "containers": [{
                            "name": "coredns",
                            "image": Image::CoreDns.name(),
                            "args": ["-conf", "/etc/coredns/Corefile"],
                            "ports": [
                                {"name": "dns", "containerPort": CLUSTER_DNS_PORT, "protocol": "UDP"},
                                {"name": "dns-tcp", "containerPort": CLUSTER_DNS_PORT, "protocol": "TCP"},
                                {"name": "metrics", "containerPort": 9153, "protocol": "TCP"},
                            ],
                            "livenessProbe": http_check("/health", 8080),
                            "readinessProbe": http_check("/ready", 8181),
                            "securityContext": {
                                "allowPrivilegeEscalation": false,
                                "readOnlyRootFilesystem": true,
                            },
                            "volumeMounts": [{"name": "config", "mountPath": "/etc/coredns", "readOnly": true}],
                        }],
                        "volumes": [{
                            "name": "config",
                            "configMap": {"name": CLUSTER_DNS_NAME, "items": [{"key": "Corefile", "path": "Corefile"}]},
                        }],
                    },
                },
            },
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(CLUSTER_DNS_NAME),
            "spec": {
                "selector": labels,
                "clusterIP": address.to_string(),
                "ports": [
                    {"name": "dns", "port": 53, "targetPort": CLUSTER_DNS_PORT, "protocol": "UDP"},
                    {"name": "dns-tcp", "port": 53, "targetPort": CLUSTER_DNS_PORT, "protocol": "TCP"},
                ],
            },
        }),
    ])
}

pub fn unbound_config(cluster: &Cluster) -> Result<String> {
    let domain = &cluster.options.kubelet.domain;
    let cluster_dns = cluster.cluster_dns_address()?;
    let mut conf = format!(
        r#"server:
  do-daemonize: no
  interface: 0.0.0.0
  interface-automatic: yes
  access-control: 0.0.0.0/0 allow
  chroot: ""
  username: ""
  directory: "/etc/unbound"
  logfile: ""
  use-syslog: no
  log-time-ascii: yes
  verbosity: 1
  num-threads: 2
  so-reuseport: yes
  do-not-query-localhost: no
  domain-insecure: "{domain}."
  domain-insecure: "in-addr.arpa."
  domain-insecure: "ip6.arpa."
forward-zone:
  name: "{domain}."
  forward-addr: {cluster_dns}
forward-zone:
  name: "in-addr.arpa."
  forward-addr: {cluster_dns}
forward-zone:
  name: "ip6.arpa."
  forward-addr: {cluster_dns}
"#
    );
    if !cluster.dns_servers.is_empty() {
        conf.push_str("forward-zone:\n  name: \".\"\n");
        for server in &cluster.dns_servers {
            conf.push_str(&format!("  forward-addr: {server}\n"));
        }
    }
    Ok(conf)
}

fn node_dns_objects(cluster: &Cluster) -> Result<Vec<Value>> {
    let labels = json!({"k8s-app": NODE_DNS_NAME});
    Ok(vec![
        service_account(NODE_DNS_SERVICE_ACCOUNT),
        config_map(NODE_DNS_NAME, "unbound.conf", unbound_config(cluster)?),
        json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": with_image(NODE_DNS_NAME, Image::Unbound),
            "spec": {
                "selector": {"matchLabels": labels},
                "updateStrategy": {"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": 1}},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "serviceAccountName": NODE_DNS_SERVICE_ACCOUNT,
                        "priorityClassName": "system-node-critical",
                        "hostNetwork": true,
                        "dnsPolicy": "Default",
                        "tolerations": [{"operator": "Exists"}],
                        "containers": [{
                            "name": "unbound",
                            "image": Image::Unbound.name(),
                            "args": ["-d", "-p", "-c", "/etc/unbound/unbound.conf"],
                            "securityContext": {
                                "allowPrivilegeEscalation": false,
                                "readOnlyRootFilesystem": true,
                                "capabilities": {"add": ["NET_BIND_SERVICE"], "drop": ["all"]},
                            },
                            "readinessProbe": {"tcpSocket": {"port": 53, "host": "localhost"}, "periodSeconds": 1},
                            "volumeMounts": [{"name": "config", "mountPath": "/etc/unbound", "readOnly": true}],
                        }],
                        "volumes": [{
                            "name": "config",
                            "configMap": {"name": NODE_DNS_NAME, "items": [{"key": "unbound.conf", "path": "unbound.conf"}]},
                        }],
                    },
                },
            },
        }),
    ])
}

fn etcd_backup_config(cluster: &Cluster) -> Result<String> {
    let endpoints: Vec<String> = cluster.control_planes().map(|n| client_url(&n.address)).collect();
    serde_yaml::to_string(&json!({
        "backup-dir": ETCD_BACKUP_DIR,
        "listen": format!("0.0.0.0:{ETCD_BACKUP_PORT}"),
        "rotate": cluster.etcd_backup.rotate,
        "etcd": {
            "endpoints": endpoints,
            "tls-ca-file": format!("{ETCD_BACKUP_SECRET_DIR}/ca.crt"),
            "tls-cert-file": format!("{ETCD_BACKUP_SECRET_DIR}/tls.crt"),
            "tls-key-file": format!("{ETCD_BACKUP_SECRET_DIR}/tls.key"),
        },
    }))
    .context("render etcd backup config")
}

fn etcd_backup_objects(cluster: &Cluster) -> Result<Vec<Value>> {
    let backup = &cluster.etcd_backup;
    let labels = json!({"app.kubernetes.io/name": ETCD_BACKUP_NAME});
    Ok(vec![
        service_account(ETCD_BACKUP_NAME),
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": ETCD_BACKUP_NAME,
                "namespace": SYSTEM_NAMESPACE,
                "annotations": {ANNOTATION_ISSUE_ETCD_CLIENT: ETCD_ROOT_USER},
            },
        }),
        config_map(ETCD_BACKUP_NAME, "config.yml", etcd_backup_config(cluster)?),
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": with_image(ETCD_BACKUP_NAME, Image::EtcdBackup),
            "spec": {
                "replicas": 1,
                "strategy": {"type": "Recreate"},
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "serviceAccountName": ETCD_BACKUP_NAME,
                        "containers": [{
                            "name": ETCD_BACKUP_NAME,
                            "image": Image::EtcdBackup.name(),
                            "command": ["etcdbackup", "-config", "/etc/etcdbackup/config.yml"],
                            "ports": [{"name": "http", "containerPort": ETCD_BACKUP_PORT}],
                            "volumeMounts": [
                                {"name": "config", "mountPath": "/etc/etcdbackup", "readOnly": true},
                                {"name": "secret", "mountPath": ETCD_BACKUP_SECRET_DIR, "readOnly": true},
                                {"name": "data", "mountPath": ETCD_BACKUP_DIR},
                            ],
                        }],
                        "volumes": [
                            {"name": "config", "configMap": {"name": ETCD_BACKUP_NAME}},
                            {"name": "secret", "secret": {"secretName": ETCD_BACKUP_NAME}},
                            {"name": "data", "persistentVolumeClaim": {"claimName": backup.pvc_name}},
                        ],
                    },
                },
            },
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(ETCD_BACKUP_NAME),
            "spec": {
                "selector": labels,
                "ports": [{"name": "http", "port": ETCD_BACKUP_PORT, "targetPort": ETCD_BACKUP_PORT}],
            },
        }),
        json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": with_image(ETCD_BACKUP_NAME, Image::Tools),
            "spec": {
                "schedule": backup.schedule,
                "concurrencyPolicy": "Forbid",
                "jobTemplate": {"spec": {"template": {"spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": ETCD_BACKUP_NAME,
                        "image": Image::Tools.name(),
                        "command": [
                            "curl", "-sSf", "-XPOST",
                            format!("http://{ETCD_BACKUP_NAME}.{SYSTEM_NAMESPACE}.svc:{ETCD_BACKUP_PORT}/api/v1/backup"),
                        ],
                    }],
                }}}},
            },
        }),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_cluster;
    use cke_core::cluster::EtcdBackup;

    fn keys(defs: &[ResourceDefinition]) -> Vec<&str> {
        defs.iter().map(|d| d.key.as_str()).collect()
    }

    fn find<'a>(defs: &'a [ResourceDefinition], key: &str) -> &'a ResourceDefinition {
        defs.iter().find(|d| d.key == key).unwrap()
    }

    #[test]
    fn test_dns_objects_for_plain_cluster() {
        let c = test_cluster(3, 2);
        let defs = static_resources(&c).unwrap();
        let keys = keys(&defs);
        for key in [
            "ServiceAccount/kube-system/cke-cluster-dns",
            "ConfigMap/kube-system/cluster-dns",
            "Deployment/kube-system/cluster-dns",
            "Service/kube-system/cluster-dns",
            "ServiceAccount/kube-system/cke-node-dns",
            "ConfigMap/kube-system/node-dns",
            "DaemonSet/kube-system/node-dns",
        ] {
            assert!(keys.contains(&key), "{key} missing from {keys:?}");
        }
        assert!(!keys.iter().any(|k| k.contains(ETCD_BACKUP_NAME)));
        assert!(defs.iter().all(|d| d.revision > 0));

        let deployment = find(&defs, "Deployment/kube-system/cluster-dns");
        assert_eq!(deployment.image, Image::CoreDns.name());
        assert_eq!(find(&defs, "DaemonSet/kube-system/node-dns").image, Image::Unbound.name());
        let service = find(&defs, "Service/kube-system/cluster-dns");
        let address = c.cluster_dns_address().unwrap().to_string();
        assert_eq!(service.definition["spec"]["clusterIP"], address.as_str());
    }

    #[test]
    fn test_dns_config_follows_declaration() {
        let mut c = test_cluster(1, 0);
        c.dns_servers.clear();
        assert!(corefile(&c).contains("forward . /etc/resolv.conf"));
        assert!(!unbound_config(&c).unwrap().contains("name: \".\""));

        let before = static_resources(&c).unwrap();
        c.dns_servers = vec!["8.8.8.8".into(), "1.1.1.1".into()];
        c.options.kubelet.domain = "example.internal".into();
        assert!(corefile(&c).contains("kubernetes example.internal in-addr.arpa"));
        assert!(corefile(&c).contains("forward . 8.8.8.8 1.1.1.1"));
        let unbound = unbound_config(&c).unwrap();
        assert!(unbound.contains("name: \"example.internal.\"\n  forward-addr: 10.68.0.10"));
        assert!(unbound.contains("  forward-addr: 1.1.1.1\n"));

        let after = static_resources(&c).unwrap();
        let key = "ConfigMap/kube-system/cluster-dns";
        assert_ne!(find(&before, key).revision, find(&after, key).revision);
        let key = "Deployment/kube-system/cluster-dns";
        assert_eq!(find(&before, key).revision, find(&after, key).revision);
    }

    #[test]
    fn test_etcd_backup_objects_when_enabled() {
        let mut c = test_cluster(3, 0);
        c.etcd_backup = EtcdBackup {
            enabled: true,
            pvc_name: "backup-pvc".into(),
            schedule: "*/30 * * * *".into(),
            rotate: 5,
        };
        let defs = static_resources(&c).unwrap();
        let secret = find(&defs, "Secret/kube-system/etcdbackup");
        assert_eq!(secret.annotation(ANNOTATION_ISSUE_ETCD_CLIENT), Some(ETCD_ROOT_USER));
        let config = find(&defs, "ConfigMap/kube-system/etcdbackup").definition["data"]["config.yml"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(config.contains("rotate: 5"));
        assert_eq!(config.matches(":2379").count(), 3);
        let service = find(&defs, "Service/kube-system/etcdbackup");
        assert_eq!(service.definition["spec"]["ports"][0]["port"], 8080);
        let cron = find(&defs, "CronJob/kube-system/etcdbackup");
        assert_eq!(cron.definition["spec"]["schedule"], "*/30 * * * *");
        let deployment = find(&defs, "Deployment/kube-system/etcdbackup");
        assert_eq!(
            deployment.definition["spec"]["template"]["spec"]["volumes"][2]["persistentVolumeClaim"]["claimName"],
            "backup-pvc"
        );
    }

    #[test]
    fn test_rendering_is_stable() {
        let c = test_cluster(2, 1);
        assert_eq!(static_resources(&c).unwrap(), static_resources(&c).unwrap());
    }
}
