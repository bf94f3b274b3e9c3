//! In-memory stand-ins for every infrastructure seam.
//!
//! [`FakeAgent`] simulates a docker host: it understands the commands the
//! container engine issues and keeps containers, volumes, images and files in
//! memory. The other fakes record calls and return scripted results.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cke_core::Error;
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::node::Node;
use cke_core::resource::ResourceDefinition;
use cke_core::status::{EndpointSubset, KubeNode};
use cke_storage::{MemoryKv, Storage};
use serde_json::json;

use crate::agent::{Agent, RunOutput};
use crate::etcd::{EndpointStatus, EtcdApi, EtcdMemberInfo, url_host};
use crate::infra::Infrastructure;
use crate::k8s::{EvictOutcome, KubeApi, PodRef};
use crate::local::LocalRunner;
use crate::vault::{CertIssuer, CertRequest, IssuedCert};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Split a command line the way a POSIX shell splits words.
pub fn shell_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    cur.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if in_word {
        words.push(cur);
    }
    words
}

/// A container on a [`FakeAgent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeContainer {
    pub image: String,
    pub args: Vec<String>,
    pub flags: Vec<String>,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub containers: BTreeMap<String, FakeContainer>,
    pub volumes: BTreeSet<String>,
    pub images: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub commands: Vec<String>,
    /// Commands containing any of these substrings fail.
    pub fail_patterns: Vec<String>,
}

/// Docker host simulator.
pub struct FakeAgent {
    address: String,
    state: Mutex<HostState>,
}

impl FakeAgent {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        lock(&self.state)
    }

    /// Pretend `name` runs `image` with a parameter file holding `params_json`.
    pub fn with_container(&self, name: &str, image: &str, running: bool, params_json: &str) {
        let mut st = self.state();
        st.containers.insert(
            name.to_string(),
            FakeContainer {
                image: image.to_string(),
                running,
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        );
        st.files
            .insert(format!("{}/{name}", crate::container::PARAMS_DIR), params_json.as_bytes().to_vec());
    }

    pub fn fail_on(&self, pattern: &str) {
        self.state().fail_patterns.push(pattern.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state().containers.get(name).cloned()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    fn handle(&self, cmd: &str, input: &[u8]) -> Result<String> {
        let mut st = self.state();
        st.commands.push(cmd.to_string());
        if st.fail_patterns.iter().any(|p| cmd.contains(p.as_str())) {
            return Err(Error::fatal(format!("command failed on {}: {cmd}", self.address)).into());
        }
        let w = shell_words(cmd);
        let w: Vec<&str> = w.iter().map(String::as_str).collect();

        match w.as_slice() {
            ["docker", "version", ..] => Ok("fake".into()),
            ["docker", "ps", "-a", ..] => Ok(st.containers.keys().cloned().collect::<Vec<_>>().join("\n")),
            ["docker", "container", "inspect", names @ ..] => {
                let entries: Vec<_> = names
                    .iter()
                    .filter_map(|n| st.containers.get(*n).map(|c| (n, c)))
                    .map(|(n, c)| {
                        json!({
                            "Name": format!("/{n}"),
                            "State": {
                                "Running": c.running,
                                "StartedAt": c.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                            },
                            "Config": {"Image": c.image},
                        })
                    })
                    .collect();
                Ok(serde_json::to_string(&entries)?)
            }
            ["if", "[", "-f", path, ..] => Ok(st
                .files
                .get(*path)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()),
            ["docker", "image", "inspect", image, ..] => {
                let image = image.to_string();
                st.images.insert(image);
                Ok(String::new())
            }
            ["docker", "volume", "ls", "-q", "--filter", filter] => {
                let name = filter
                    .trim_start_matches("name=")
                    .trim_start_matches('^')
                    .trim_end_matches('$');
                Ok(if st.volumes.contains(name) { name.to_string() } else { String::new() })
            }
            ["docker", "volume", "create", name] => {
                let name = name.to_string();
                st.volumes.insert(name);
                Ok(String::new())
            }
            ["docker", "volume", "rm", name] => {
                st.volumes.remove(*name);
                Ok(String::new())
            }
            ["docker", "container", "stop", name] => {
                if let Some(c) = st.containers.get_mut(*name) {
                    c.running = false;
                }
                Ok(String::new())
            }
            ["docker", "rm", "-f", name] => {
                st.containers.remove(*name);
                Ok(String::new())
            }
            ["docker", "rm", "-f", name, _, _, rest @ ..] if rest.starts_with(&["docker", "run"]) => {
                let name = name.to_string();
                let mut c = FakeContainer {
                    running: true,
                    started_at: Some(Utc::now()),
                    ..Default::default()
                };
                let mut it = rest[2..].iter();
                for tok in it.by_ref() {
                    if tok.starts_with('-') {
                        c.flags.push(tok.to_string());
                    } else {
                        c.image = tok.to_string();
                        break;
                    }
                }
                c.args = it.map(|s| s.to_string()).collect();
                st.containers.insert(name, c);
                Ok(String::new())
            }
            ["mkdir", "-p", dir, "&&", "cat", ">", path, ..] => {
                let (dir, path) = (dir.to_string(), path.to_string());
                st.dirs.insert(dir);
                st.files.insert(path, input.to_vec());
                Ok(String::new())
            }
            ["mkdir", "-p", dirs @ ..] => {
                for d in dirs {
                    st.dirs.insert(d.to_string());
                }
                Ok(String::new())
            }
            ["rm", "-f", path] => {
                st.files.remove(*path);
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl Agent for FakeAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<RunOutput> {
        let stdout = self.handle(command, input)?;
        Ok(RunOutput {
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
        })
    }
}

#[derive(Debug, Default)]
pub struct EtcdState {
    pub members: Vec<EtcdMemberInfo>,
    pub next_id: u64,
    /// Endpoint host → (applied index, healthy). Missing hosts are unreachable.
    pub progress: HashMap<String, (u64, bool)>,
    pub leader_index: u64,
    pub users: BTreeSet<String>,
    pub grants: BTreeMap<String, String>,
    pub calls: Vec<String>,
    pub fail_member_add: bool,
}

/// Fake managed etcd cluster.
#[derive(Default)]
pub struct FakeEtcd {
    state: Mutex<EtcdState>,
}

impl FakeEtcd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, EtcdState> {
        lock(&self.state)
    }

    /// Add a started, healthy, in-sync member on `addr`.
    pub fn add_started(&self, addr: &str) -> u64 {
        let mut st = self.state();
        st.next_id += 1;
        let id = st.next_id;
        st.members.push(EtcdMemberInfo {
            id,
            name: addr.to_string(),
            peer_urls: vec![crate::etcd::peer_url(addr)],
            client_urls: vec![crate::etcd::client_url(addr)],
        });
        let idx = st.leader_index;
        st.progress.insert(addr.to_string(), (idx, true));
        id
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl EtcdApi for FakeEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMemberInfo>> {
        Ok(self.state().members.clone())
    }

    async fn member_add(&self, peer_url: &str) -> Result<EtcdMemberInfo> {
        let mut st = self.state();
        st.calls.push(format!("member-add {peer_url}"));
        if st.fail_member_add {
            bail!(Error::transient("member add refused"));
        }
        st.next_id += 1;
        let m = EtcdMemberInfo {
            id: st.next_id,
            name: String::new(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: Vec::new(),
        };
        st.members.push(m.clone());
        if let Some(host) = url_host(peer_url) {
            let idx = st.leader_index;
            st.progress.insert(host.to_string(), (idx, true));
        }
        Ok(m)
    }

    async fn member_remove(&self, id: u64) -> Result<()> {
        let mut st = self.state();
        st.calls.push(format!("member-remove {id}"));
        st.members.retain(|m| m.id != id);
        Ok(())
    }

    async fn status(&self, endpoint: &str) -> Result<EndpointStatus> {
        let st = self.state();
        let host = url_host(endpoint).unwrap_or(endpoint);
        let Some((applied, _)) = st.progress.get(host) else {
            bail!(Error::transient(format!("{endpoint} unreachable")));
        };
        let member_id = st
            .members
            .iter()
            .find(|m| m.peer_urls.iter().any(|u| url_host(u) == Some(host)))
            .map(|m| m.id)
            .unwrap_or_default();
        Ok(EndpointStatus {
            member_id,
            leader: st.members.first().map(|m| m.id).unwrap_or_default(),
            raft_index: st.leader_index,
            raft_applied_index: *applied,
        })
    }

    async fn health(&self, endpoint: &str) -> Result<bool> {
        let host = url_host(endpoint).unwrap_or(endpoint);
        Ok(self.state().progress.get(host).is_some_and(|(_, h)| *h))
    }

    async fn user_add(&self, name: &str) -> Result<()> {
        self.state().users.insert(name.to_string());
        Ok(())
    }

    async fn grant_prefix(&self, user: &str, prefix: &str) -> Result<()> {
        self.state().grants.insert(user.to_string(), prefix.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct KubeState {
    pub ready: bool,
    pub nodes: Vec<KubeNode>,
    pub endpoints: BTreeMap<String, Vec<EndpointSubset>>,
    pub config_maps: BTreeMap<String, BTreeMap<String, String>>,
    /// Resource key → live annotations.
    pub annotations: BTreeMap<String, BTreeMap<String, String>>,
    pub applied: Vec<(String, serde_json::Value)>,
    pub cluster_roles: BTreeSet<String>,
    pub pods: BTreeMap<String, Vec<PodRef>>,
    pub evicted: Vec<PodRef>,
    /// Pods whose eviction a disruption budget refuses.
    pub blocked: BTreeSet<String>,
}

/// Fake Kubernetes API server.
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, KubeState> {
        lock(&self.state)
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn is_ready(&self) -> Result<bool> {
        Ok(self.state().ready)
    }

    async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
        Ok(self.state().nodes.clone())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Vec<EndpointSubset>>> {
        Ok(self.state().endpoints.get(&format!("{namespace}/{name}")).cloned())
    }

    async fn put_endpoints(&self, namespace: &str, name: &str, subsets: &[EndpointSubset]) -> Result<()> {
        self.state()
            .endpoints
            .insert(format!("{namespace}/{name}"), subsets.to_vec());
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state().config_maps.get(&format!("{namespace}/{name}")).cloned())
    }

    async fn apply_config_map(&self, namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<()> {
        self.state()
            .config_maps
            .insert(format!("{namespace}/{name}"), data.clone());
        Ok(())
    }

    async fn get_annotations(&self, def: &ResourceDefinition) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state().annotations.get(&def.key).cloned())
    }

    async fn apply(&self, def: &ResourceDefinition, body: &serde_json::Value) -> Result<()> {
        let mut st = self.state();
        let annotations: BTreeMap<String, String> = body["metadata"]["annotations"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        st.annotations.insert(def.key.clone(), annotations);
        if def.kind == "ClusterRole" {
            st.cluster_roles.insert(def.name.clone());
        }
        st.applied.push((def.key.clone(), body.clone()));
        Ok(())
    }

    async fn cluster_role_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().cluster_roles.contains(name))
    }

    async fn cordon(&self, node: &str, unschedulable: bool) -> Result<()> {
        let mut st = self.state();
        match st.nodes.iter_mut().find(|n| n.name == node) {
            Some(n) => {
                n.unschedulable = unschedulable;
                Ok(())
            }
            None => Err(Error::NotFound.into()),
        }
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodRef>> {
        Ok(self.state().pods.get(node).cloned().unwrap_or_default())
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome> {
        let mut st = self.state();
        if st.blocked.contains(&format!("{namespace}/{name}")) {
            return Ok(EvictOutcome::Blocked);
        }
        let mut found = false;
        for pods in st.pods.values_mut() {
            let before = pods.len();
            pods.retain(|p| !(p.namespace == namespace && p.name == name));
            found |= pods.len() != before;
        }
        if !found {
            return Ok(EvictOutcome::Gone);
        }
        st.evicted.push(PodRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(EvictOutcome::Evicted)
    }
}

/// Certificate issuer returning placeholder PEM text.
#[derive(Default)]
pub struct FakeCerts {
    pub ssh_keys: Mutex<BTreeMap<String, String>>,
    pub issued: Mutex<Vec<(CaName, String)>>,
}

#[async_trait]
impl CertIssuer for FakeCerts {
    async fn issue(&self, ca: CaName, req: &CertRequest) -> Result<IssuedCert> {
        lock(&self.issued).push((ca, req.common_name.clone()));
        Ok(IssuedCert {
            certificate: format!("CERT {ca} {}", req.common_name),
            private_key: format!("KEY {ca} {}", req.common_name),
            issuing_ca: format!("CA {ca}"),
        })
    }

    async fn ssh_keys(&self) -> Result<BTreeMap<String, String>> {
        Ok(lock(&self.ssh_keys).clone())
    }

    async fn service_account_key(&self) -> Result<String> {
        Ok("SERVICE ACCOUNT KEY".into())
    }

    async fn encryption_key(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Local runner answering from a script keyed by program name.
#[derive(Default)]
pub struct FakeLocal {
    /// Program → stdout, or `Err(message)` to fail.
    pub script: Mutex<HashMap<String, std::result::Result<String, String>>>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl FakeLocal {
    pub fn respond(&self, program: &str, result: std::result::Result<&str, &str>) {
        lock(&self.script).insert(
            program.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl LocalRunner for FakeLocal {
    async fn run(&self, argv: &[String], args: &[String], _timeout: Duration) -> Result<String> {
        let mut call = argv.to_vec();
        call.extend_from_slice(args);
        lock(&self.calls).push(call);
        let program = argv.first().cloned().unwrap_or_default();
        match lock(&self.script).get(&program) {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(msg)) => Err(Error::fatal(msg.clone()).into()),
            None => Ok(String::new()),
        }
    }
}

/// [`Infrastructure`] wired to the fakes and a [`MemoryKv`].
pub struct FakeInfra {
    pub storage: Storage,
    pub agents: Mutex<HashMap<String, Arc<FakeAgent>>>,
    pub unreachable: Mutex<BTreeSet<String>>,
    /// Addresses whose apiserver refuses connections.
    pub apiservers_down: Mutex<BTreeSet<String>>,
    pub etcd: Arc<FakeEtcd>,
    pub kube: Arc<FakeKube>,
    pub certs: Arc<FakeCerts>,
    pub local: FakeLocal,
    http: reqwest::Client,
}

impl Default for FakeInfra {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInfra {
    pub fn new() -> Self {
        Self {
            storage: Storage::new(Arc::new(MemoryKv::new()), "/cke/"),
            agents: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(BTreeSet::new()),
            apiservers_down: Mutex::new(BTreeSet::new()),
            etcd: Arc::new(FakeEtcd::new()),
            kube: Arc::new(FakeKube::new()),
            certs: Arc::new(FakeCerts::default()),
            local: FakeLocal::default(),
            http: reqwest::Client::new(),
        }
    }

    /// The simulated host at `addr`, created on first use.
    pub fn host(&self, addr: &str) -> Arc<FakeAgent> {
        lock(&self.agents)
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(FakeAgent::new(addr)))
            .clone()
    }

    pub fn set_unreachable(&self, addr: &str) {
        lock(&self.unreachable).insert(addr.to_string());
    }

    pub fn set_apiserver_down(&self, addr: &str) {
        lock(&self.apiservers_down).insert(addr.to_string());
    }
}

#[async_trait]
impl Infrastructure for FakeInfra {
    async fn agent(&self, addr: &str) -> Option<Arc<dyn Agent>> {
        if lock(&self.unreachable).contains(addr) {
            return None;
        }
        Some(self.host(addr) as Arc<dyn Agent>)
    }

    async fn etcd(&self, _endpoints: &[String]) -> Result<Arc<dyn EtcdApi>> {
        Ok(self.etcd.clone())
    }

    async fn kube(&self, _cluster: &Cluster, node: &Node) -> Result<Arc<dyn KubeApi>> {
        if lock(&self.apiservers_down).contains(&node.address) {
            return Err(Error::transient(format!("connect to apiserver on {}: refused", node.address)).into());
        }
        Ok(self.kube.clone())
    }

    fn certs(&self) -> Arc<dyn CertIssuer> {
        self.certs.clone()
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn local(&self) -> &dyn LocalRunner {
        &self.local
    }

    async fn close(&self) {}
}
