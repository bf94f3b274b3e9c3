use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::node::Node;

/// Default DNS domain of the kubelet.
pub const DEFAULT_KUBELET_DOMAIN: &str = "cluster.local";

/// A host path mounted into a component container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub propagation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selinux_label: String,
}

impl Mount {
    pub fn new(source: &str, destination: &str, read_only: bool) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            read_only,
            propagation: String::new(),
            selinux_label: String::new(),
        }
    }

    /// Render as a `docker run --volume` argument.
    pub fn to_volume_arg(&self) -> String {
        let mut flags = vec![if self.read_only { "ro" } else { "rw" }];
        if !self.propagation.is_empty() {
            flags.push(&self.propagation);
        }
        if !self.selinux_label.is_empty() {
            flags.push(&self.selinux_label);
        }
        format!("{}:{}:{}", self.source, self.destination, flags.join(","))
    }

    fn validate(&self) -> Result<()> {
        if !self.source.starts_with('/') {
            return Err(Error::bad_request(format!("bind source is not absolute: {}", self.source)).into());
        }
        if !self.destination.starts_with('/') {
            return Err(Error::bad_request(format!(
                "bind destination is not absolute: {}",
                self.destination
            ))
            .into());
        }
        match self.propagation.as_str() {
            "" | "private" | "rprivate" | "shared" | "rshared" | "slave" | "rslave" => {}
            other => {
                return Err(Error::bad_request(format!("invalid bind propagation: {other}")).into());
            }
        }
        match self.selinux_label.as_str() {
            "" | "z" | "Z" => Ok(()),
            other => Err(Error::bad_request(format!("invalid selinux label: {other}")).into()),
        }
    }
}

/// Per-component parameter bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub extra_binds: Vec<Mount>,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl ServiceParams {
    /// Drift comparison: ordered args, binds as a set, env as a map.
    pub fn equal_params(&self, other: &ServiceParams) -> bool {
        if self.extra_args != other.extra_args {
            return false;
        }
        let a: BTreeSet<&Mount> = self.extra_binds.iter().collect();
        let b: BTreeSet<&Mount> = other.extra_binds.iter().collect();
        a == b && self.extra_env == other.extra_env
    }

    /// Copy of these parameters with every `--initial-` argument dropped.
    ///
    /// Etcd honors those flags only on first start, so they never count as drift.
    pub fn without_initial_args(&self) -> ServiceParams {
        ServiceParams {
            extra_args: self
                .extra_args
                .iter()
                .filter(|a| !a.starts_with("--initial-"))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        for m in &self.extra_binds {
            m.validate()?;
        }
        for k in self.extra_env.keys() {
            if k.is_empty() || k.contains('=') {
                return Err(Error::bad_request(format!("invalid environment variable name: {k:?}")).into());
            }
        }
        Ok(())
    }
}

/// Kubelet parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletParams {
    #[serde(flatten)]
    pub params: ServiceParams,
    #[serde(default = "default_kubelet_domain")]
    pub domain: String,
    #[serde(default)]
    pub allow_swap: bool,
}

impl Default for KubeletParams {
    fn default() -> Self {
        Self {
            params: ServiceParams::default(),
            domain: default_kubelet_domain(),
            allow_swap: false,
        }
    }
}

fn default_kubelet_domain() -> String {
    DEFAULT_KUBELET_DOMAIN.to_string()
}

/// Per-component options of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub etcd: ServiceParams,
    #[serde(default)]
    pub rivers: ServiceParams,
    #[serde(default)]
    pub kube_api: ServiceParams,
    #[serde(default)]
    pub kube_controller_manager: ServiceParams,
    #[serde(default)]
    pub kube_scheduler: ServiceParams,
    #[serde(default)]
    pub kube_proxy: ServiceParams,
    #[serde(default)]
    pub kubelet: KubeletParams,
}

/// Node reboot behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootConfig {
    #[serde(default)]
    pub reboot_command: Vec<String>,
    #[serde(default)]
    pub boot_check_command: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_eviction_timeout")]
    pub eviction_timeout_seconds: u64,
    #[serde(default = "default_one")]
    pub max_concurrent_reboots: usize,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            reboot_command: Vec::new(),
            boot_check_command: Vec::new(),
            command_timeout_seconds: default_command_timeout(),
            eviction_timeout_seconds: default_eviction_timeout(),
            max_concurrent_reboots: 1,
        }
    }
}

/// One step of a repair operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairStep {
    pub repair_command: Vec<String>,
    #[serde(default)]
    pub need_drain: bool,
    #[serde(default = "default_watch_seconds")]
    pub watch_seconds: u64,
    pub health_check_command: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

/// An operation (e.g. `unreachable`) of a repair procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOperation {
    pub operation: String,
    pub repair_steps: Vec<RepairStep>,
}

/// Repair operations applicable to a set of machine types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairProcedure {
    pub machine_types: Vec<String>,
    pub repair_operations: Vec<RepairOperation>,
}

/// Periodic etcd snapshots taken inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdBackup {
    #[serde(default)]
    pub enabled: bool,
    /// PersistentVolumeClaim in `kube-system` that stores the snapshots.
    #[serde(default)]
    pub pvc_name: String,
    /// Cron schedule of the backup job.
    #[serde(default)]
    pub schedule: String,
    /// Number of snapshots kept.
    #[serde(default = "default_backup_rotate")]
    pub rotate: u32,
}

impl Default for EtcdBackup {
    fn default() -> Self {
        Self {
            enabled: false,
            pvc_name: String::new(),
            schedule: String::new(),
            rotate: default_backup_rotate(),
        }
    }
}

impl EtcdBackup {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.pvc_name.is_empty() {
            return Err(Error::bad_request("pvc_name is empty").into());
        }
        if self.schedule.split_whitespace().count() != 5 {
            return Err(Error::bad_request(format!("invalid schedule: {:?}", self.schedule)).into());
        }
        if self.rotate == 0 {
            return Err(Error::bad_request("rotate must be positive").into());
        }
        Ok(())
    }
}

fn default_backup_rotate() -> u32 {
    14
}

/// Machine repair behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default)]
    pub repair_procedures: Vec<RepairProcedure>,
    #[serde(default = "default_one")]
    pub max_concurrent_repairs: usize,
    #[serde(default = "default_eviction_timeout")]
    pub evict_timeout_seconds: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            repair_procedures: Vec::new(),
            max_concurrent_repairs: 1,
            evict_timeout_seconds: default_eviction_timeout(),
        }
    }
}

fn default_command_timeout() -> u64 {
    30
}
fn default_eviction_timeout() -> u64 {
    600
}
fn default_watch_seconds() -> u64 {
    600
}
fn default_one() -> usize {
    1
}

/// Why a repair entry could not be mapped onto a repair step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepairLookupError {
    #[error("repair procedure not found for machine type {0:?}")]
    ProcedureNotFound(String),
    #[error("repair operation {0:?} not found")]
    OperationNotFound(String),
    #[error("repair step {0} out of range")]
    StepOutOfRange(usize),
}

impl RepairConfig {
    /// Find the operation covering `(machine_type, operation)`.
    pub fn get_matching_repair_operation(
        &self,
        machine_type: &str,
        operation: &str,
    ) -> std::result::Result<&RepairOperation, RepairLookupError> {
        let procedure = self
            .repair_procedures
            .iter()
            .find(|p| p.machine_types.iter().any(|t| t == machine_type))
            .ok_or_else(|| RepairLookupError::ProcedureNotFound(machine_type.to_string()))?;
        procedure
            .repair_operations
            .iter()
            .find(|o| o.operation == operation)
            .ok_or_else(|| RepairLookupError::OperationNotFound(operation.to_string()))
    }

    /// Find step `step` of the operation covering `(machine_type, operation)`.
    pub fn get_matching_repair_step(
        &self,
        machine_type: &str,
        operation: &str,
        step: usize,
    ) -> std::result::Result<&RepairStep, RepairLookupError> {
        let op = self.get_matching_repair_operation(machine_type, operation)?;
        op.repair_steps
            .get(step)
            .ok_or(RepairLookupError::StepOutOfRange(step))
    }

    fn validate(&self) -> Result<()> {
        let mut types = HashSet::new();
        for procedure in &self.repair_procedures {
            if procedure.machine_types.is_empty() {
                return Err(Error::bad_request("repair procedure has no machine types").into());
            }
            for t in &procedure.machine_types {
                if !types.insert(t) {
                    return Err(Error::bad_request(format!(
                        "machine type {t:?} appears in more than one repair procedure"
                    ))
                    .into());
                }
            }
            let mut ops = HashSet::new();
            for op in &procedure.repair_operations {
                if op.operation.is_empty() || !ops.insert(&op.operation) {
                    return Err(Error::bad_request(format!(
                        "repair operation name {:?} is empty or duplicated",
                        op.operation
                    ))
                    .into());
                }
                for step in &op.repair_steps {
                    if step.repair_command.is_empty() || step.health_check_command.is_empty() {
                        return Err(Error::bad_request(format!(
                            "repair operation {:?} has a step without a command",
                            op.operation
                        ))
                        .into());
                    }
                }
            }
        }
        if self.max_concurrent_repairs == 0 {
            return Err(Error::bad_request("max_concurrent_repairs must be positive").into());
        }
        Ok(())
    }
}

/// The declared desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub taint_control_plane: bool,
    pub service_subnet: String,
    #[serde(default)]
    pub pod_subnet: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// `namespace/name` of the Service that provides upstream DNS.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_service: String,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub etcd_backup: EtcdBackup,
    #[serde(default)]
    pub reboot: RebootConfig,
    #[serde(default)]
    pub repair: RepairConfig,
}

impl Cluster {
    /// Parse a cluster declaration from YAML.
    pub fn from_yaml(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("Failed to parse cluster YAML")
    }

    pub fn control_planes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.control_plane)
    }

    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.nodename() == name)
    }

    /// Address of the cluster DNS Service: the tenth of the service subnet.
    pub fn cluster_dns_address(&self) -> Result<IpAddr> {
        let net = parse_cidr(&self.service_subnet).context("service_subnet")?;
        let addr = match net.network() {
            IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a).wrapping_add(10))),
            IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a).wrapping_add(10))),
        };
        if !net.contains(addr) {
            return Err(Error::bad_request(format!(
                "service_subnet {} has no room for the cluster DNS address",
                self.service_subnet
            ))
            .into());
        }
        Ok(addr)
    }

    /// Validate the declaration.
    ///
    /// A template (used by the inventory integration) may omit node
    /// addresses and subnets are still required.
    pub fn validate(&self, is_template: bool) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_request("cluster name is empty").into());
        }
        parse_cidr(&self.service_subnet).context("service_subnet")?;
        if !self.pod_subnet.is_empty() {
            parse_cidr(&self.pod_subnet).context("pod_subnet")?;
        }
        for s in &self.dns_servers {
            s.parse::<IpAddr>()
                .map_err(|_| Error::bad_request(format!("invalid DNS server address: {s}")))?;
        }
        if !self.dns_service.is_empty() {
            let parts: Vec<&str> = self.dns_service.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                return Err(Error::bad_request(format!(
                    "dns_service must be namespace/name: {}",
                    self.dns_service
                ))
                .into());
            }
        }

        let mut addresses = HashSet::new();
        let mut names = HashSet::new();
        for node in &self.nodes {
            node.validate(is_template)?;
            if is_template {
                continue;
            }
            if !addresses.insert(node.address.as_str()) {
                return Err(Error::bad_request(format!("duplicate node address: {}", node.address)).into());
            }
            if !names.insert(node.nodename()) {
                return Err(Error::bad_request(format!("duplicate node name: {}", node.nodename())).into());
            }
        }

        let opts = &self.options;
        for (name, params) in [
            ("etcd", &opts.etcd),
            ("rivers", &opts.rivers),
            ("kube-api", &opts.kube_api),
            ("kube-controller-manager", &opts.kube_controller_manager),
            ("kube-scheduler", &opts.kube_scheduler),
            ("kube-proxy", &opts.kube_proxy),
            ("kubelet", &opts.kubelet.params),
        ] {
            params.validate().with_context(|| format!("options.{name}"))?;
        }
        validate_domain(&opts.kubelet.domain).context("options.kubelet.domain")?;

        if self.reboot.max_concurrent_reboots == 0 {
            return Err(Error::bad_request("max_concurrent_reboots must be positive").into());
        }
        self.repair.validate().context("repair")?;
        self.etcd_backup.validate().context("etcd_backup")?;
        Ok(())
    }
}

/// Parse `a.b.c.d/n` (or IPv6) into a network.
pub fn parse_cidr(s: &str) -> Result<IpNetwork> {
    if !s.contains('/') {
        return Err(Error::bad_request(format!("invalid CIDR: {s:?}")).into());
    }
    s.parse::<IpNetwork>()
        .map_err(|e| Error::bad_request(format!("invalid CIDR {s:?}: {e}")).into())
}

fn validate_domain(domain: &str) -> Result<()> {
    let re = regex::Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .context("domain pattern")?;
    if domain.len() > 253 || !re.is_match(domain) {
        return Err(Error::bad_request(format!("invalid domain: {domain:?}")).into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_cluster(cps: &[&str], workers: &[&str]) -> Cluster {
        let mut nodes = Vec::new();
        for a in cps {
            nodes.push(Node {
                address: a.to_string(),
                user: "cybozu".into(),
                control_plane: true,
                ..Default::default()
            });
        }
        for a in workers {
            nodes.push(Node {
                address: a.to_string(),
                user: "cybozu".into(),
                ..Default::default()
            });
        }
        Cluster {
            name: "test".into(),
            nodes,
            service_subnet: "10.68.0.0/16".into(),
            pod_subnet: "10.64.0.0/14".into(),
            ..Default::default()
        }
    }

    const YAML: &str = r#"
name: prod
nodes:
  - address: 10.0.0.11
    user: cybozu
    control_plane: true
  - address: 10.0.0.21
    hostname: worker1
    user: cybozu
    labels:
      cke.cybozu.com/role: cs
    taints:
      - key: cke.cybozu.com/state
        effect: NoSchedule
service_subnet: 10.68.0.0/16
pod_subnet: 10.64.0.0/14
dns_servers: ["8.8.8.8"]
options:
  etcd:
    extra_args: ["--quota-backend-bytes=8589934592"]
  kubelet:
    extra_binds:
      - source: /var/lib/k8s-containerd
        destination: /var/lib/k8s-containerd
        propagation: rshared
reboot:
  reboot_command: ["true"]
  boot_check_command: ["bash", "-c", "echo true"]
repair:
  repair_procedures:
    - machine_types: ["Cray-1"]
      repair_operations:
        - operation: unreachable
          repair_steps:
            - repair_command: ["reset"]
              need_drain: true
              health_check_command: ["check"]
            - repair_command: ["power-cycle"]
              health_check_command: ["check"]
"#;

    #[test]
    fn test_parse_yaml_defaults() {
        let c = Cluster::from_yaml(YAML).unwrap();
        assert_eq!(c.nodes.len(), 2);
        assert!(c.nodes[0].control_plane);
        assert_eq!(c.nodes[1].nodename(), "worker1");
        assert_eq!(c.options.kubelet.domain, "cluster.local");
        assert_eq!(c.options.kubelet.params.extra_binds[0].propagation, "rshared");
        assert_eq!(c.reboot.max_concurrent_reboots, 1);
        assert_eq!(c.reboot.eviction_timeout_seconds, 600);
        assert_eq!(c.repair.repair_procedures[0].repair_operations[0].repair_steps[0].watch_seconds, 600);
        c.validate(false).unwrap();
    }

    #[test]
    fn test_json_roundtrip_is_equal() {
        let c = Cluster::from_yaml(YAML).unwrap();
        let json = serde_json::to_vec(&c).unwrap();
        let back: Cluster = serde_json::from_slice(&json).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_validate_rejects() {
        let base = test_cluster(&["10.0.0.11"], &["10.0.0.21"]);
        base.validate(false).unwrap();

        let mut c = base.clone();
        c.name.clear();
        assert!(c.validate(false).is_err());

        let mut c = base.clone();
        c.service_subnet = "10.68.0.0".into();
        assert!(c.validate(false).is_err());

        let mut c = base.clone();
        c.nodes[1].address = "10.0.0.11".into();
        assert!(c.validate(false).is_err());

        let mut c = base.clone();
        c.options.kube_api.extra_binds.push(Mount::new("relative", "/x", true));
        assert!(c.validate(false).is_err());

        let mut c = base.clone();
        c.dns_servers.push("dns.example".into());
        assert!(c.validate(false).is_err());

        let mut c = base;
        c.options.kubelet.domain = "Bad_Domain".into();
        assert!(c.validate(false).is_err());
    }

    #[test]
    fn test_cluster_dns_address() {
        let mut c = test_cluster(&["10.0.0.11"], &[]);
        assert_eq!(c.cluster_dns_address().unwrap().to_string(), "10.68.0.10");
        c.service_subnet = "fd00:10::/112".into();
        assert_eq!(c.cluster_dns_address().unwrap().to_string(), "fd00:10::a");
        c.service_subnet = "10.68.0.0/29".into();
        assert!(c.cluster_dns_address().is_err());
    }

    #[test]
    fn test_etcd_backup_validation() {
        let mut c = test_cluster(&["10.0.0.11"], &[]);
        c.validate(false).unwrap();

        c.etcd_backup = EtcdBackup {
            enabled: true,
            pvc_name: "etcdbackup-pvc".into(),
            schedule: "0 * * * *".into(),
            ..Default::default()
        };
        c.validate(false).unwrap();
        assert_eq!(c.etcd_backup.rotate, 14);

        let mut bad = c.clone();
        bad.etcd_backup.schedule = "hourly".into();
        assert!(format!("{:#}", bad.validate(false).unwrap_err()).contains("etcd_backup"));
        let mut bad = c;
        bad.etcd_backup.pvc_name.clear();
        assert!(bad.validate(false).is_err());
    }

    #[test]
    fn test_template_allows_missing_address() {
        let mut c = test_cluster(&[""], &[""]);
        assert!(c.validate(false).is_err());
        c.validate(true).unwrap();
        c.nodes[0].user.clear();
        assert!(c.validate(true).is_err());
    }

    #[test]
    fn test_equal_params() {
        let mut a = ServiceParams {
            extra_args: vec!["--a".into(), "--b".into()],
            extra_binds: vec![Mount::new("/x", "/x", true), Mount::new("/y", "/y", false)],
            extra_env: BTreeMap::from([("K".to_string(), "V".to_string())]),
        };
        let mut b = a.clone();
        b.extra_binds.reverse();
        assert!(a.equal_params(&b));

        b.extra_args.reverse();
        assert!(!a.equal_params(&b));

        b = a.clone();
        b.extra_binds[0].selinux_label = "z".into();
        assert!(!a.equal_params(&b));

        b = a.clone();
        a.extra_env.insert("K2".into(), "V2".into());
        assert!(!a.equal_params(&b));
    }

    #[test]
    fn test_without_initial_args() {
        let p = ServiceParams {
            extra_args: vec!["--initial-cluster-state=existing".into(), "--listen".into()],
            ..Default::default()
        };
        assert_eq!(p.without_initial_args().extra_args, vec!["--listen".to_string()]);
    }

    #[test]
    fn test_mount_volume_arg() {
        let mut m = Mount::new("/a", "/b", true);
        assert_eq!(m.to_volume_arg(), "/a:/b:ro");
        m.propagation = "rshared".into();
        m.selinux_label = "z".into();
        assert_eq!(m.to_volume_arg(), "/a:/b:ro,rshared,z");
    }

    #[test]
    fn test_repair_lookup_errors() {
        let c = Cluster::from_yaml(YAML).unwrap();
        let r = &c.repair;
        assert_eq!(
            r.get_matching_repair_operation("Cray-2", "unreachable").unwrap_err(),
            RepairLookupError::ProcedureNotFound("Cray-2".into())
        );
        assert_eq!(
            r.get_matching_repair_operation("Cray-1", "unhealthy").unwrap_err(),
            RepairLookupError::OperationNotFound("unhealthy".into())
        );
        assert_eq!(
            r.get_matching_repair_step("Cray-1", "unreachable", 2).unwrap_err(),
            RepairLookupError::StepOutOfRange(2)
        );
        let step = r.get_matching_repair_step("Cray-1", "unreachable", 1).unwrap();
        assert_eq!(step.repair_command, vec!["power-cycle".to_string()]);
    }

    #[test]
    fn test_repair_validate_duplicate_machine_type() {
        let mut c = Cluster::from_yaml(YAML).unwrap();
        let dup = c.repair.repair_procedures[0].clone();
        c.repair.repair_procedures.push(dup);
        assert!(c.validate(false).is_err());
    }
}
