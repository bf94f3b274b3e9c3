//! Component containers: names, images, built-in parameters and run specs.
//!
//! The built-in parameters computed here are written to the parameter file
//! when a container starts and compared against it when deciding restarts,
//! so they must depend only on the cluster declaration.

use std::collections::BTreeMap;
use std::fmt;

use cke_core::cluster::{Cluster, Mount, ServiceParams};
use cke_core::images::Image;
use cke_core::node::Node;
use cke_core::status::{NodeStatus, ServiceStatus};
use cke_infra::container::{KubeletParamsFile, RunSpec, ServiceParamsFile};
use cke_infra::etcd::{ETCD_CLIENT_PORT, ETCD_PEER_PORT, client_url, peer_url};
use cke_infra::kubeconfig::{APISERVER_PORT, RIVERS_PORT};

/// Docker volume holding etcd data.
pub const ETCD_VOLUME: &str = "etcd-cke";
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";
pub const ETCD_PKI_DIR: &str = "/etc/etcd/pki";
pub const K8S_DIR: &str = "/etc/kubernetes";
pub const K8S_PKI_DIR: &str = "/etc/kubernetes/pki";
pub const APISERVER_DIR: &str = "/etc/kubernetes/apiserver";
pub const CONTROLLER_MANAGER_DIR: &str = "/etc/kubernetes/controller-manager";
pub const SCHEDULER_DIR: &str = "/etc/kubernetes/scheduler";
pub const KUBELET_DIR: &str = "/etc/kubernetes/kubelet";
pub const PROXY_DIR: &str = "/etc/kubernetes/proxy";
pub const KUBERNETES_CA_FILE: &str = "/etc/kubernetes/pki/ca.crt";
pub const LOG_DIR: &str = "/var/log/kubernetes";

/// A component container run by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Rivers,
    Etcd,
    ApiServer,
    ControllerManager,
    Scheduler,
    Kubelet,
    Proxy,
}

impl Service {
    /// Kubernetes components in boot order.
    pub const KUBERNETES: &'static [Service] = &[
        Self::ApiServer,
        Self::ControllerManager,
        Self::Scheduler,
        Self::Kubelet,
        Self::Proxy,
    ];

    /// Containers that only belong on control-plane nodes.
    pub const CONTROL_PLANE_ONLY: &'static [Service] =
        &[Self::Etcd, Self::ApiServer, Self::ControllerManager, Self::Scheduler];

    /// Container name on the host.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rivers => "rivers",
            Self::Etcd => "etcd",
            Self::ApiServer => "kube-apiserver",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
            Self::Proxy => "kube-proxy",
        }
    }

    pub fn image(self) -> &'static str {
        match self {
            Self::Rivers => Image::Tools.name(),
            Self::Etcd => Image::Etcd.name(),
            _ => Image::Kubernetes.name(),
        }
    }

    pub fn control_plane_only(self) -> bool {
        Self::CONTROL_PLANE_ONLY.contains(&self)
    }

    /// Nodes this service must run on, in declaration order.
    pub fn nodes(self, cluster: &Cluster) -> Vec<&Node> {
        cluster
            .nodes
            .iter()
            .filter(|n| n.control_plane || !self.control_plane_only())
            .collect()
    }

    pub fn status(self, ns: &NodeStatus) -> &ServiceStatus {
        match self {
            Self::Rivers => &ns.rivers,
            Self::Etcd => &ns.etcd.service,
            Self::ApiServer => &ns.apiserver,
            Self::ControllerManager => &ns.controller_manager,
            Self::Scheduler => &ns.scheduler,
            Self::Kubelet => &ns.kubelet.service,
            Self::Proxy => &ns.proxy,
        }
    }

    /// User-supplied parameters for this service.
    pub fn extra(self, cluster: &Cluster) -> &ServiceParams {
        let o = &cluster.options;
        match self {
            Self::Rivers => &o.rivers,
            Self::Etcd => &o.etcd,
            Self::ApiServer => &o.kube_api,
            Self::ControllerManager => &o.kube_controller_manager,
            Self::Scheduler => &o.kube_scheduler,
            Self::Kubelet => &o.kubelet.params,
            Self::Proxy => &o.kube_proxy,
        }
    }

    /// Parameters the engine itself passes on `node`.
    pub fn built_in(self, cluster: &Cluster, node: &Node) -> ServiceParams {
        let (args, binds) = match self {
            Self::Rivers => (rivers_args(cluster), vec![]),
            Self::Etcd => (etcd_args(node, &[], true), etcd_binds()),
            Self::ApiServer => (apiserver_args(cluster, node), apiserver_binds()),
            Self::ControllerManager => (controller_manager_args(cluster), component_binds(CONTROLLER_MANAGER_DIR)),
            Self::Scheduler => (scheduler_args(), component_binds(SCHEDULER_DIR)),
            Self::Kubelet => (kubelet_args(cluster, node), kubelet_binds()),
            Self::Proxy => (proxy_args(cluster, node), proxy_binds()),
        };
        ServiceParams {
            extra_args: args,
            extra_binds: binds,
            extra_env: BTreeMap::new(),
        }
    }

    /// Container spec for `node`, with `built_in` as computed for this start.
    pub fn run_spec(self, cluster: &Cluster, built_in: ServiceParams) -> RunSpec {
        let extra = self.extra(cluster).clone();
        let mut args = vec![self.program().to_string()];
        args.extend(built_in.extra_args.iter().cloned());
        args.extend(extra.extra_args.iter().cloned());
        let mut binds = built_in.extra_binds.clone();
        binds.extend(extra.extra_binds.iter().cloned());
        let mut env = built_in.extra_env.clone();
        env.extend(extra.extra_env.clone());

        let kubelet = (self == Self::Kubelet).then(|| KubeletParamsFile {
            domain: cluster.options.kubelet.domain.clone(),
            allow_swap: cluster.options.kubelet.allow_swap,
        });
        RunSpec {
            image: self.image().to_string(),
            args,
            binds,
            env,
            privileged: matches!(self, Self::Kubelet | Self::Proxy),
            pid_host: self == Self::Kubelet,
            entrypoint: None,
            params: ServiceParamsFile {
                built_in,
                extra,
                kubelet,
            },
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::Rivers => "rivers",
            Self::Etcd => "etcd",
            Self::ApiServer => "kube-apiserver",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
            Self::Proxy => "kube-proxy",
        }
    }

    /// Host directories the container logs to or reads from.
    pub fn dirs(self) -> Vec<String> {
        let dirs: &[&str] = match self {
            Self::Rivers => &[],
            Self::Etcd => &[ETCD_PKI_DIR],
            Self::ApiServer => &[K8S_PKI_DIR, APISERVER_DIR, LOG_DIR],
            Self::ControllerManager => &[K8S_PKI_DIR, CONTROLLER_MANAGER_DIR, LOG_DIR],
            Self::Scheduler => &[SCHEDULER_DIR, LOG_DIR],
            Self::Kubelet => &[K8S_PKI_DIR, KUBELET_DIR, "/var/lib/kubelet", "/var/log/pods", "/var/log/containers"],
            Self::Proxy => &[PROXY_DIR, LOG_DIR],
        };
        dirs.iter().map(|d| d.to_string()).collect()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn rivers_args(cluster: &Cluster) -> Vec<String> {
    let upstreams: Vec<String> = cluster
        .control_planes()
        .map(|n| format!("{}:{APISERVER_PORT}", n.address))
        .collect();
    vec![
        format!("--listen=127.0.0.1:{RIVERS_PORT}"),
        format!("--upstreams={}", upstreams.join(",")),
    ]
}

/// Etcd arguments. `initial` lists `(name, peer url)` of the initial cluster.
pub fn etcd_args(node: &Node, initial: &[(String, String)], new_cluster: bool) -> Vec<String> {
    let addr = &node.address;
    let mut args = vec![
        format!("--name={addr}"),
        format!("--data-dir={ETCD_DATA_DIR}"),
        format!("--listen-peer-urls=https://0.0.0.0:{ETCD_PEER_PORT}"),
        format!("--listen-client-urls=https://0.0.0.0:{ETCD_CLIENT_PORT}"),
        format!("--advertise-client-urls={}", client_url(addr)),
        format!("--initial-advertise-peer-urls={}", peer_url(addr)),
        format!("--cert-file={ETCD_PKI_DIR}/server.crt"),
        format!("--key-file={ETCD_PKI_DIR}/server.key"),
        "--client-cert-auth=true".to_string(),
        format!("--trusted-ca-file={ETCD_PKI_DIR}/ca-client.crt"),
        format!("--peer-cert-file={ETCD_PKI_DIR}/peer.crt"),
        format!("--peer-key-file={ETCD_PKI_DIR}/peer.key"),
        "--peer-client-cert-auth=true".to_string(),
        format!("--peer-trusted-ca-file={ETCD_PKI_DIR}/ca-peer.crt"),
        "--enable-v2=false".to_string(),
        "--auto-compaction-mode=periodic".to_string(),
        "--auto-compaction-retention=24h".to_string(),
    ];
    if !initial.is_empty() {
        let members: Vec<String> = initial.iter().map(|(n, u)| format!("{n}={u}")).collect();
        args.push(format!("--initial-cluster={}", members.join(",")));
        args.push("--initial-cluster-token=cke".to_string());
        let state = if new_cluster { "new" } else { "existing" };
        args.push(format!("--initial-cluster-state={state}"));
    }
    args
}

fn etcd_binds() -> Vec<Mount> {
    vec![
        Mount::new(ETCD_VOLUME, ETCD_DATA_DIR, false),
        Mount::new(ETCD_PKI_DIR, ETCD_PKI_DIR, true),
    ]
}

fn etcd_servers(cluster: &Cluster) -> String {
    cluster
        .control_planes()
        .map(|n| client_url(&n.address))
        .collect::<Vec<_>>()
        .join(",")
}

fn apiserver_args(cluster: &Cluster, node: &Node) -> Vec<String> {
    let d = APISERVER_DIR;
    vec![
        format!("--advertise-address={}", node.address),
        "--bind-address=0.0.0.0".to_string(),
        format!("--secure-port={APISERVER_PORT}"),
        format!("--etcd-servers={}", etcd_servers(cluster)),
        format!("--etcd-cafile={d}/etcd-ca.crt"),
        format!("--etcd-certfile={d}/etcd-client.crt"),
        format!("--etcd-keyfile={d}/etcd-client.key"),
        format!("--client-ca-file={KUBERNETES_CA_FILE}"),
        format!("--tls-cert-file={d}/apiserver.crt"),
        format!("--tls-private-key-file={d}/apiserver.key"),
        format!("--kubelet-certificate-authority={KUBERNETES_CA_FILE}"),
        format!("--kubelet-client-certificate={d}/apiserver.crt"),
        format!("--kubelet-client-key={d}/apiserver.key"),
        format!("--service-account-key-file={d}/service-account.key"),
        format!("--service-account-signing-key-file={d}/service-account.key"),
        format!("--service-account-issuer=https://{}:{APISERVER_PORT}", node.address),
        format!("--service-cluster-ip-range={}", cluster.service_subnet),
        format!("--encryption-provider-config={d}/encryption.yml"),
        format!("--requestheader-client-ca-file={d}/aggregation-ca.crt"),
        "--requestheader-allowed-names=front-proxy-client".to_string(),
        "--requestheader-extra-headers-prefix=X-Remote-Extra-".to_string(),
        "--requestheader-group-headers=X-Remote-Group".to_string(),
        "--requestheader-username-headers=X-Remote-User".to_string(),
        format!("--proxy-client-cert-file={d}/proxy-client.crt"),
        format!("--proxy-client-key-file={d}/proxy-client.key"),
        "--authorization-mode=Node,RBAC".to_string(),
        "--enable-admission-plugins=NodeRestriction".to_string(),
        "--endpoint-reconciler-type=none".to_string(),
        "--allow-privileged=true".to_string(),
        format!("--audit-log-path={LOG_DIR}/audit.log"),
    ]
}

fn apiserver_binds() -> Vec<Mount> {
    vec![
        Mount::new(K8S_PKI_DIR, K8S_PKI_DIR, true),
        Mount::new(APISERVER_DIR, APISERVER_DIR, true),
        Mount::new(LOG_DIR, LOG_DIR, false),
    ]
}

fn component_binds(dir: &str) -> Vec<Mount> {
    vec![
        Mount::new(K8S_PKI_DIR, K8S_PKI_DIR, true),
        Mount::new(dir, dir, true),
    ]
}

fn controller_manager_args(cluster: &Cluster) -> Vec<String> {
    let d = CONTROLLER_MANAGER_DIR;
    vec![
        format!("--cluster-name={}", cluster.name),
        format!("--kubeconfig={d}/kubeconfig"),
        format!("--authentication-kubeconfig={d}/kubeconfig"),
        format!("--authorization-kubeconfig={d}/kubeconfig"),
        format!("--service-account-private-key-file={d}/service-account.key"),
        format!("--root-ca-file={KUBERNETES_CA_FILE}"),
        format!("--service-cluster-ip-range={}", cluster.service_subnet),
        "--use-service-account-credentials=true".to_string(),
        "--leader-elect=true".to_string(),
    ]
}

fn scheduler_args() -> Vec<String> {
    let d = SCHEDULER_DIR;
    vec![
        format!("--kubeconfig={d}/kubeconfig"),
        format!("--authentication-kubeconfig={d}/kubeconfig"),
        format!("--authorization-kubeconfig={d}/kubeconfig"),
        "--leader-elect=true".to_string(),
    ]
}

fn kubelet_args(cluster: &Cluster, node: &Node) -> Vec<String> {
    let d = KUBELET_DIR;
    let mut args = vec![
        format!("--kubeconfig={d}/kubeconfig"),
        format!("--config={d}/config.yml"),
        format!("--hostname-override={}", node.nodename()),
        format!("--node-ip={}", node.address),
        "--container-runtime-endpoint=unix:///run/containerd/containerd.sock".to_string(),
    ];
    if !node.labels.is_empty() {
        let labels: Vec<String> = node.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        args.push(format!("--node-labels={}", labels.join(",")));
    }
    let mut taints: Vec<String> = node
        .taints
        .iter()
        .map(|t| format!("{}={}:{}", t.key, t.value, t.effect))
        .collect();
    if node.control_plane && cluster.taint_control_plane {
        taints.push("cke.cybozu.com/master=true:PreferNoSchedule".to_string());
    }
    if !taints.is_empty() {
        args.push(format!("--register-with-taints={}", taints.join(",")));
    }
    args
}

fn kubelet_binds() -> Vec<Mount> {
    let mut lib = Mount::new("/var/lib/kubelet", "/var/lib/kubelet", false);
    lib.propagation = "rshared".to_string();
    vec![
        Mount::new(K8S_DIR, K8S_DIR, true),
        lib,
        Mount::new("/run", "/run", false),
        Mount::new("/sys", "/sys", true),
        Mount::new("/dev", "/dev", false),
        Mount::new("/var/log/pods", "/var/log/pods", false),
        Mount::new("/var/log/containers", "/var/log/containers", false),
    ]
}

fn proxy_args(cluster: &Cluster, node: &Node) -> Vec<String> {
    let mut args = vec![
        format!("--kubeconfig={PROXY_DIR}/kubeconfig"),
        format!("--hostname-override={}", node.nodename()),
        "--proxy-mode=ipvs".to_string(),
    ];
    if !cluster.pod_subnet.is_empty() {
        args.push(format!("--cluster-cidr={}", cluster.pod_subnet));
    }
    args
}

fn proxy_binds() -> Vec<Mount> {
    vec![
        Mount::new(PROXY_DIR, PROXY_DIR, true),
        Mount::new("/lib/modules", "/lib/modules", true),
        Mount::new("/run/xtables.lock", "/run/xtables.lock", false),
    ]
}

/// Kubelet configuration file contents.
pub fn kubelet_config(cluster: &Cluster) -> serde_json::Value {
    let kubelet = &cluster.options.kubelet;
    serde_json::json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "clusterDomain": kubelet.domain,
        "clusterDNS": cluster.dns_servers,
        "failSwapOn": !kubelet.allow_swap,
        "tlsCertFile": format!("{KUBELET_DIR}/kubelet.crt"),
        "tlsPrivateKeyFile": format!("{KUBELET_DIR}/kubelet.key"),
        "authentication": {
            "x509": {"clientCAFile": KUBERNETES_CA_FILE},
            "webhook": {"enabled": true},
            "anonymous": {"enabled": false},
        },
        "authorization": {"mode": "Webhook"},
        "cgroupDriver": "systemd",
    })
}

/// Whether the running instance of `svc` differs from the declaration.
pub fn is_outdated(svc: Service, cluster: &Cluster, node: &Node, status: &ServiceStatus) -> bool {
    if status.image != svc.image() {
        return true;
    }
    let want = svc.built_in(cluster, node);
    let extra = svc.extra(cluster);
    if svc == Service::Etcd {
        return !want
            .without_initial_args()
            .equal_params(&status.built_in_params.without_initial_args())
            || !extra
                .without_initial_args()
                .equal_params(&status.extra_params.without_initial_args());
    }
    !want.equal_params(&status.built_in_params) || !extra.equal_params(&status.extra_params)
}

/// [`is_outdated`] on the node's instance of `svc`, also comparing the kubelet
/// domain and swap setting the node reported.
pub fn is_node_outdated(svc: Service, cluster: &Cluster, node: &Node, ns: &NodeStatus) -> bool {
    if is_outdated(svc, cluster, node, svc.status(ns)) {
        return true;
    }
    if svc != Service::Kubelet {
        return false;
    }
    let want = &cluster.options.kubelet;
    ns.kubelet.domain != want.domain || ns.kubelet.allow_swap != want.allow_swap
}
