//! Decision ladder: the single highest-priority operation the cluster needs.
//!
//! Pure and synchronous. Rungs are evaluated in order and the first one that
//! produces an operator wins; within a rung nodes follow declaration order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cke_core::cluster::Cluster;
use cke_core::constraints::Constraints;
use cke_core::node::Node;
use cke_core::reboot::{RebootQueueEntry, RebootStatus, dedup_reboot_queue_entries};
use cke_core::record::OperationPhase;
use cke_core::repair::{RepairQueueEntry, RepairStatus, RepairStepStatus};
use cke_core::resource::{ResourceDefinition, sort_resources};
use cke_core::status::ClusterStatus;
use cke_op::maintain::{cluster_dns_data, etcd_endpoints_outdated};
use cke_op::service::{is_node_outdated, is_outdated};
use cke_op::{Operator, Service, component, etcd, maintain, reboot, repair, resource, stop};

/// Everything one decision looks at.
pub struct DecideInput<'a> {
    pub cluster: &'a Cluster,
    pub status: &'a ClusterStatus,
    pub constraints: &'a Constraints,
    /// Engine-owned definitions, applied ahead of user resources.
    pub static_resources: &'a [ResourceDefinition],
    pub resources: &'a [ResourceDefinition],
    pub reboot_entries: &'a [RebootQueueEntry],
    pub reboot_disabled: bool,
    pub repair_entries: &'a [RepairQueueEntry],
    pub repair_disabled: bool,
    pub now: DateTime<Utc>,
}

type Decision = (Option<Box<dyn Operator>>, OperationPhase);

fn op(o: impl Operator + 'static, phase: OperationPhase) -> Decision {
    (Some(Box::new(o)), phase)
}

/// Pick the next operator, or `None` with [`OperationPhase::Completed`] when converged.
///
/// A `None` with any other phase means the rung is blocked and nothing can
/// be done until the state changes.
pub fn decide_ops(input: &DecideInput<'_>) -> Decision {
    let c = input.cluster;
    let st = input.status;

    if let Some(d) = rivers_ops(c, st) {
        return d;
    }
    if let Some(d) = etcd_boot_ops(c, st) {
        return d;
    }
    if let Some(d) = k8s_start_ops(c, st) {
        return d;
    }
    if let Some(d) = etcd_maintain_ops(c, st) {
        return d;
    }

    let api_node = c
        .control_planes()
        .find(|n| st.node(&n.address).apiserver.running)
        .filter(|_| st.kubernetes.is_control_plane_ready);
    if let Some(api) = api_node {
        if let Some(d) = k8s_maintain_ops(c, st, api) {
            return d;
        }
        if let Some(d) = resource_ops(st, input.static_resources, input.resources, api) {
            return d;
        }
    }
    if let Some(d) = stop_cp_ops(c, st) {
        return d;
    }
    if let Some(api) = api_node {
        if !input.repair_disabled {
            if let Some(d) = repair_ops(input, api) {
                return d;
            }
        }
        if !input.reboot_disabled {
            if let Some(d) = reboot_ops(input, api) {
                return d;
            }
        }
    }
    (None, OperationPhase::Completed)
}

/// Reachable nodes in `nodes` where `svc` is stopped.
fn stopped(st: &ClusterStatus, svc: Service, nodes: &[&Node]) -> Vec<Node> {
    nodes
        .iter()
        .filter(|n| {
            let ns = st.node(&n.address);
            ns.ssh_connected && !svc.status(&ns).running
        })
        .map(|n| (*n).clone())
        .collect()
}

fn outdated(c: &Cluster, st: &ClusterStatus, svc: Service, nodes: &[&Node]) -> Vec<Node> {
    nodes
        .iter()
        .filter(|n| {
            let ns = st.node(&n.address);
            ns.ssh_connected && svc.status(&ns).running && is_node_outdated(svc, c, n, &ns)
        })
        .map(|n| (*n).clone())
        .collect()
}

fn rivers_ops(c: &Cluster, st: &ClusterStatus) -> Option<Decision> {
    let nodes = Service::Rivers.nodes(c);
    let boot = stopped(st, Service::Rivers, &nodes);
    if !boot.is_empty() {
        return Some(op(component::bootstrap_op(c, Service::Rivers, &boot), OperationPhase::Rivers));
    }
    let restart = outdated(c, st, Service::Rivers, &nodes);
    if !restart.is_empty() {
        return Some(op(component::restart_op(c, Service::Rivers, &restart), OperationPhase::Rivers));
    }
    None
}

fn etcd_boot_ops(c: &Cluster, st: &ClusterStatus) -> Option<Decision> {
    let cps: Vec<&Node> = c.control_planes().collect();
    let any_data = cps.iter().any(|n| st.node(&n.address).etcd.has_data);
    if !any_data {
        if cps.iter().all(|n| st.node(&n.address).ssh_connected) {
            return Some(op(etcd::boot_op(c), OperationPhase::EtcdBoot));
        }
        // Data on an unreachable node must not be overwritten by a fresh cluster.
        return Some((None, OperationPhase::EtcdBoot));
    }

    let start: Vec<Node> = cps
        .iter()
        .filter(|n| {
            let ns = st.node(&n.address);
            ns.ssh_connected && ns.etcd.has_data && !ns.etcd.service.running
        })
        .map(|n| (*n).clone())
        .collect();
    if !start.is_empty() {
        return Some(op(etcd::start_op(c, &start), OperationPhase::EtcdStart));
    }
    if !st.etcd.is_healthy {
        return Some(op(etcd::wait_cluster_op(c), OperationPhase::EtcdWait));
    }
    None
}

fn k8s_start_ops(c: &Cluster, st: &ClusterStatus) -> Option<Decision> {
    for &svc in Service::KUBERNETES {
        let nodes = svc.nodes(c);
        let mut boot = stopped(st, svc, &nodes);
        let mut restart = outdated(c, st, svc, &nodes);
        if svc == Service::ApiServer {
            boot.truncate(1);
            restart.truncate(1);
        }
        if !boot.is_empty() {
            return Some(op(component::bootstrap_op(c, svc, &boot), OperationPhase::K8sStart));
        }
        if !restart.is_empty() {
            return Some(op(component::restart_op(c, svc, &restart), OperationPhase::K8sStart));
        }
    }
    None
}

fn etcd_maintain_ops(c: &Cluster, st: &ClusterStatus) -> Option<Decision> {
    let phase = OperationPhase::EtcdMaintain;
    let members = &st.etcd.members;

    for (addr, m) in members {
        if !m.name.is_empty() {
            continue;
        }
        return Some(match c.node(addr).filter(|n| n.control_plane) {
            Some(n) => op(etcd::AddMemberOp::new(c, n, Some(m.id)), phase),
            None => op(etcd::remove_member_op(c, m.id, addr), phase),
        });
    }

    for (addr, m) in members {
        if c.node(addr).is_none() {
            return Some(op(etcd::remove_member_op(c, m.id, addr), phase));
        }
    }

    let all_in_sync = c
        .control_planes()
        .filter(|n| members.contains_key(&n.address))
        .all(|n| st.etcd.is_in_sync(&n.address));
    if !all_in_sync {
        return Some((None, phase));
    }

    for n in c.nodes.iter().filter(|n| !n.control_plane) {
        if let Some(m) = members.get(&n.address) {
            return Some(op(etcd::destroy_member_op(c, n, m.id), phase));
        }
    }

    for n in c.control_planes() {
        if !members.contains_key(&n.address) && st.node(&n.address).ssh_connected {
            return Some(op(etcd::AddMemberOp::new(c, n, None), phase));
        }
    }

    for n in c.control_planes() {
        let ns = st.node(&n.address);
        if ns.ssh_connected && ns.etcd.service.running && is_outdated(Service::Etcd, c, n, &ns.etcd.service) {
            return Some(op(etcd::restart_op(c, n), phase));
        }
    }
    None
}

fn k8s_maintain_ops(c: &Cluster, st: &ClusterStatus, api: &Node) -> Option<Decision> {
    let phase = OperationPhase::K8sMaintain;
    let k = &st.kubernetes;
    if !k.rbac_installed {
        return Some(op(maintain::install_rbac_op(api), phase));
    }
    match &k.etcd_endpoints {
        None => return Some(op(maintain::etcd_endpoints_op(c, api, true), phase)),
        Some(live) if etcd_endpoints_outdated(c, live) => {
            return Some(op(maintain::etcd_endpoints_op(c, api, false), phase));
        }
        Some(_) => {}
    }
    match &k.dns_config {
        None => Some(op(maintain::cluster_dns_op(c, api, true), phase)),
        Some(data) if *data != cluster_dns_data(c) => Some(op(maintain::cluster_dns_op(c, api, false), phase)),
        Some(_) => None,
    }
}

fn outdated_resources<'a>(
    st: &ClusterStatus,
    defs: impl Iterator<Item = &'a ResourceDefinition>,
) -> Vec<ResourceDefinition> {
    let mut out: Vec<ResourceDefinition> = defs
        .filter(|d| d.need_update(st.kubernetes.resource_statuses.get(&d.key)))
        .cloned()
        .collect();
    sort_resources(&mut out);
    out
}

fn resource_ops(
    st: &ClusterStatus,
    owned: &[ResourceDefinition],
    resources: &[ResourceDefinition],
    api: &Node,
) -> Option<Decision> {
    let mut defs = outdated_resources(st, owned.iter());
    // A user definition never replaces an engine-owned object.
    let user = resources.iter().filter(|d| !owned.iter().any(|o| o.key == d.key));
    defs.extend(outdated_resources(st, user));
    if defs.is_empty() {
        return None;
    }
    Some(op(resource::apply_op(api, defs), OperationPhase::ResourceApply))
}

fn stop_cp_ops(c: &Cluster, st: &ClusterStatus) -> Option<Decision> {
    for n in c.nodes.iter().filter(|n| !n.control_plane) {
        let ns = st.node(&n.address);
        if !ns.ssh_connected {
            continue;
        }
        let svcs: Vec<Service> = Service::CONTROL_PLANE_ONLY
            .iter()
            .copied()
            .filter(|&svc| svc.status(&ns).running)
            .filter(|&svc| svc != Service::Etcd || !st.etcd.members.contains_key(&n.address))
            .collect();
        if !svcs.is_empty() {
            return Some(op(stop::stop_op(n, &svcs), OperationPhase::StopCp));
        }
    }
    None
}

fn repair_ops(input: &DecideInput<'_>, api: &Node) -> Option<Decision> {
    let phase = OperationPhase::RepairMachines;
    let c = input.cluster;
    let processing = input
        .repair_entries
        .iter()
        .filter(|e| !e.deleted && e.status == RepairStatus::Processing)
        .count();

    for e in input.repair_entries {
        let mut e = e.clone();
        e.fill_nodename(c);
        if e.deleted {
            return Some(op(repair::dequeue_op(api, &e), phase));
        }
        if e.has_finished() {
            continue;
        }
        let (step, total) = match (e.get_matching_repair_step(c), e.get_matching_repair_operation(c)) {
            (Ok(step), Ok(operation)) => (step, operation.repair_steps.len()),
            _ => return Some(op(repair::fail_op(&e), phase)),
        };
        if e.status == RepairStatus::Processing && e.step_status == RepairStepStatus::Watching {
            return Some(op(repair::check_op(api, &e, step, total), phase));
        }
        if e.status == RepairStatus::Queued && processing >= c.repair.max_concurrent_repairs {
            continue;
        }
        if !e.is_backoff_expired(input.now) {
            continue;
        }
        let timeout = Duration::from_secs(c.repair.evict_timeout_seconds);
        return Some(op(repair::RepairExecuteOp::new(api, &e, step, timeout), phase));
    }
    None
}

/// Nodes that are unreachable over SSH or not Ready in Kubernetes.
fn unreachable_nodes(c: &Cluster, st: &ClusterStatus) -> usize {
    c.nodes
        .iter()
        .filter(|n| {
            !st.node(&n.address).ssh_connected || !st.kubernetes.node(n.nodename()).is_some_and(|k| k.ready)
        })
        .count()
}

fn reboot_ops(input: &DecideInput<'_>, api: &Node) -> Option<Decision> {
    let phase = OperationPhase::RebootNodes;
    let c = input.cluster;
    let entries = dedup_reboot_queue_entries(input.reboot_entries.to_vec());
    let in_progress = entries.iter().filter(|e| e.is_in_progress()).count();
    let unreachable = unreachable_nodes(c, input.status);

    for e in &entries {
        let node = c.node(&e.node);
        match (node, e.status) {
            (None, _) | (_, RebootStatus::Cancelled) => {
                return Some(op(reboot::dequeue_op(api, e, node.map(Node::nodename)), phase));
            }
            (Some(n), RebootStatus::Draining) => {
                return Some(op(
                    reboot::RebootDrainStartOp::new(api, e.clone(), n.nodename(), &c.reboot),
                    phase,
                ));
            }
            (Some(n), RebootStatus::Rebooting) => {
                return Some(op(reboot::recover_op(api, e, n.nodename(), &c.reboot), phase));
            }
            (Some(n), RebootStatus::Queued) => {
                if in_progress >= c.reboot.max_concurrent_reboots || !e.is_backoff_expired(input.now) {
                    continue;
                }
                if unreachable > input.constraints.maximum_unreachable_nodes_for_reboot {
                    tracing::info!(
                        node = %e.node,
                        unreachable,
                        "reboot refused: too many unreachable nodes"
                    );
                    continue;
                }
                return Some(op(
                    reboot::RebootDrainStartOp::new(api, e.clone(), n.nodename(), &c.reboot),
                    phase,
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testutil::{converged, elect, running, test_cluster, LEADER};
    use cke_core::resource::{ANNOTATION_IMAGE, ANNOTATION_REVISION, ResourceDefinition};
    use cke_core::status::{EtcdMember, NodeStatus, ResourceStatus};
    use cke_infra::fake::FakeInfra;
    use cke_op::RunContext;
    use cke_op::maintain::{ETCD_ENDPOINTS_NAME, SYSTEM_NAMESPACE};
    use tokio_util::sync::CancellationToken;

    fn decide_with(
        c: &Cluster,
        st: &ClusterStatus,
        reboot: &[RebootQueueEntry],
        repair: &[RepairQueueEntry],
    ) -> (Option<String>, OperationPhase) {
        let constraints = Constraints {
            control_plane_count: c.control_planes().count(),
            ..Default::default()
        };
        let input = DecideInput {
            cluster: c,
            status: st,
            constraints: &constraints,
            static_resources: &[],
            resources: &[],
            reboot_entries: reboot,
            reboot_disabled: false,
            repair_entries: repair,
            repair_disabled: false,
            now: Utc::now(),
        };
        let (o, phase) = decide_ops(&input);
        (o.map(|o| o.name()), phase)
    }

    fn decide(c: &Cluster, st: &ClusterStatus) -> (Option<String>, OperationPhase) {
        decide_with(c, st, &[], &[])
    }

    fn name(c: &Cluster, st: &ClusterStatus) -> Option<String> {
        decide(c, st).0
    }

    #[test]
    fn test_converged_cluster_needs_nothing() {
        let c = test_cluster(3, 2);
        assert_eq!(decide(&c, &converged(&c)), (None, OperationPhase::Completed));
    }

    #[test]
    fn test_rivers_boot_then_etcd_boot() {
        let c = test_cluster(3, 3);
        let mut st = ClusterStatus::default();
        for n in &c.nodes {
            st.node_statuses.insert(
                n.address.clone(),
                NodeStatus {
                    ssh_connected: true,
                    ..Default::default()
                },
            );
        }
        assert_eq!(
            decide(&c, &st),
            (Some("rivers-bootstrap".into()), OperationPhase::Rivers)
        );

        for n in &c.nodes {
            st.node_statuses.get_mut(&n.address).unwrap().rivers = running(Service::Rivers, &c, n);
        }
        assert_eq!(decide(&c, &st), (Some("etcd-bootstrap".into()), OperationPhase::EtcdBoot));
    }

    #[test]
    fn test_etcd_boot_waits_for_every_control_plane() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        for ns in st.node_statuses.values_mut() {
            ns.etcd = Default::default();
        }
        st.node_statuses.get_mut("10.0.0.3").unwrap().ssh_connected = false;
        st.node_statuses.get_mut("10.0.0.3").unwrap().rivers = Default::default();
        // Rivers on the unreachable node cannot be booted either.
        assert_eq!(decide(&c, &st), (None, OperationPhase::EtcdBoot));
    }

    #[test]
    fn test_etcd_start_and_wait() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        st.node_statuses.get_mut("10.0.0.2").unwrap().etcd.service = Default::default();
        assert_eq!(decide(&c, &st), (Some("etcd-start".into()), OperationPhase::EtcdStart));

        let mut st = converged(&c);
        st.etcd.is_healthy = false;
        assert_eq!(decide(&c, &st), (Some("etcd-wait-cluster".into()), OperationPhase::EtcdWait));
    }

    #[test]
    fn test_kubelet_settings_change_restarts_kubelet() {
        let c0 = test_cluster(3, 2);
        let st = converged(&c0);

        let mut c = c0.clone();
        c.options.kubelet.allow_swap = !c0.options.kubelet.allow_swap;
        assert_eq!(decide(&c, &st), (Some("kubelet-restart".into()), OperationPhase::K8sStart));

        let mut c = c0.clone();
        c.options.kubelet.domain = "example.internal".into();
        assert_eq!(decide(&c, &st), (Some("kubelet-restart".into()), OperationPhase::K8sStart));
    }

    #[test]
    fn test_kubernetes_components_in_order() {
        let c = test_cluster(2, 1);
        let mut st = converged(&c);
        st.node_statuses.get_mut("10.0.1.1").unwrap().proxy = Default::default();
        st.node_statuses.get_mut("10.0.0.2").unwrap().scheduler.image = "old".into();
        assert_eq!(name(&c, &st).as_deref(), Some("kube-scheduler-restart"));

        st.node_statuses.get_mut("10.0.0.2").unwrap().scheduler = running(Service::Scheduler, &c, &c.nodes[1]);
        assert_eq!(decide(&c, &st), (Some("kube-proxy-bootstrap".into()), OperationPhase::K8sStart));
    }

    #[test]
    fn test_apiserver_restarts_one_node_per_pass() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        for ns in st.node_statuses.values_mut() {
            ns.apiserver.image = "old".into();
        }
        let input_targets = {
            let constraints = Constraints::default();
            let (o, _) = decide_ops(&DecideInput {
                cluster: &c,
                status: &st,
                constraints: &constraints,
                static_resources: &[],
                resources: &[],
                reboot_entries: &[],
                reboot_disabled: false,
                repair_entries: &[],
                repair_disabled: false,
                now: Utc::now(),
            });
            o.unwrap().targets()
        };
        assert_eq!(input_targets, vec!["10.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn test_etcd_member_add_on_scale_up() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        st.etcd.members.remove("10.0.0.3");
        st.etcd.in_sync_members.remove("10.0.0.3");
        st.node_statuses.get_mut("10.0.0.3").unwrap().etcd = Default::default();

        let constraints = Constraints::default();
        let input = DecideInput {
            cluster: &c,
            status: &st,
            constraints: &constraints,
            static_resources: &[],
            resources: &[],
            reboot_entries: &[],
            reboot_disabled: false,
            repair_entries: &[],
            repair_disabled: false,
            now: Utc::now(),
        };
        let (o, phase) = decide_ops(&input);
        let o = o.unwrap();
        assert_eq!(o.name(), "etcd-add-member");
        assert_eq!(o.targets(), vec!["10.0.0.3".to_string()]);
        assert_eq!(phase, OperationPhase::EtcdMaintain);

        // The member joined; the endpoints object is next and lists all three.
        let mut st = converged(&c);
        st.kubernetes.etcd_endpoints = None;
        let input = DecideInput { status: &st, ..input };
        let (o, _) = decide_ops(&input);
        let mut o = o.unwrap();
        assert_eq!(o.name(), "create-etcd-endpoints");

        let infra = FakeInfra::new();
        elect(&infra).await;
        let ctx = RunContext {
            infra: &infra,
            cluster: &c,
            leader: LEADER,
            cancel: CancellationToken::new(),
            now: Utc::now(),
        };
        cke_op::run_to_end(o.as_mut(), &ctx).await.unwrap();
        let kube = infra.kube.state();
        let subsets = &kube.endpoints[&format!("{SYSTEM_NAMESPACE}/{ETCD_ENDPOINTS_NAME}")];
        assert_eq!(subsets[0].addresses.len(), 3);
    }

    #[test]
    fn test_rogue_member_removed_before_kubernetes_maintenance() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        st.kubernetes.rbac_installed = false;
        st.etcd.members.insert(
            "10.0.9.9".into(),
            EtcdMember {
                id: 99,
                name: "10.0.9.9".into(),
            },
        );
        assert_eq!(
            decide(&c, &st),
            (Some("etcd-remove-member".into()), OperationPhase::EtcdMaintain)
        );
    }

    #[test]
    fn test_unstarted_member_is_readded_first() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        st.etcd.members.get_mut("10.0.0.2").unwrap().name.clear();
        st.etcd.members.insert(
            "10.0.9.9".into(),
            EtcdMember {
                id: 99,
                name: "10.0.9.9".into(),
            },
        );
        assert_eq!(name(&c, &st).as_deref(), Some("etcd-add-member"));
    }

    #[test]
    fn test_out_of_sync_member_blocks_mutation() {
        let c = test_cluster(3, 1);
        let mut st = converged(&c);
        st.etcd.in_sync_members.insert("10.0.0.1".into(), false);
        st.etcd.members.insert(
            "10.0.1.1".into(),
            EtcdMember {
                id: 42,
                name: "10.0.1.1".into(),
            },
        );
        assert_eq!(decide(&c, &st), (None, OperationPhase::EtcdMaintain));

        st.etcd.in_sync_members.insert("10.0.0.1".into(), true);
        assert_eq!(name(&c, &st).as_deref(), Some("etcd-destroy-member"));
    }

    #[test]
    fn test_etcd_initial_args_never_trigger_restart() {
        let c = test_cluster(3, 0);
        let mut st = converged(&c);
        st.node_statuses
            .get_mut("10.0.0.1")
            .unwrap()
            .etcd
            .service
            .built_in_params
            .extra_args
            .push("--initial-cluster-state=existing".into());
        assert_eq!(decide(&c, &st), (None, OperationPhase::Completed));

        st.node_statuses
            .get_mut("10.0.0.1")
            .unwrap()
            .etcd
            .service
            .built_in_params
            .extra_args
            .push("--quota-backend-bytes=8589934592".into());
        assert_eq!(decide(&c, &st), (Some("etcd-restart".into()), OperationPhase::EtcdMaintain));
    }

    #[test]
    fn test_kubernetes_maintenance_order() {
        let c = test_cluster(1, 1);
        let mut st = converged(&c);
        st.kubernetes.rbac_installed = false;
        st.kubernetes.dns_config = None;
        st.kubernetes.etcd_endpoints.as_mut().unwrap()[0].ports = vec![2380];
        assert_eq!(name(&c, &st).as_deref(), Some("install-rbac-role"));
        st.kubernetes.rbac_installed = true;
        assert_eq!(name(&c, &st).as_deref(), Some("update-etcd-endpoints"));
        st.kubernetes.etcd_endpoints = Some(cke_op::maintain::etcd_endpoint_subsets(&c));
        assert_eq!(
            decide(&c, &st),
            (Some("create-cluster-dns-configmap".into()), OperationPhase::K8sMaintain)
        );
        let mut data = cluster_dns_data(&c);
        data.insert("domain".into(), "old.local".into());
        st.kubernetes.dns_config = Some(data);
        assert_eq!(name(&c, &st).as_deref(), Some("update-cluster-dns-configmap"));
    }

    #[test]
    fn test_outdated_resources_are_applied() {
        let c = test_cluster(1, 0);
        let st = converged(&c);
        let def = ResourceDefinition::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "app"},
        }))
        .unwrap();
        let constraints = Constraints::default();
        let resources = [def];
        let input = DecideInput {
            cluster: &c,
            status: &st,
            constraints: &constraints,
            static_resources: &[],
            resources: &resources,
            reboot_entries: &[],
            reboot_disabled: false,
            repair_entries: &[],
            repair_disabled: false,
            now: Utc::now(),
        };
        let (o, phase) = decide_ops(&input);
        assert_eq!(o.unwrap().name(), "resource-apply");
        assert_eq!(phase, OperationPhase::ResourceApply);
    }

    #[test]
    fn test_fresh_cluster_gets_owned_resources_first() {
        let c = test_cluster(1, 1);
        let mut st = converged(&c);
        let owned = cke_op::static_resources(&c).unwrap();
        let namespace = ResourceDefinition::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "app"},
        }))
        .unwrap();
        let shadow = ResourceDefinition::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "cke-cluster-dns", "namespace": "kube-system"},
        }))
        .unwrap();
        let resources = [namespace, shadow];
        let constraints = Constraints::default();
        let input = DecideInput {
            cluster: &c,
            status: &st,
            constraints: &constraints,
            static_resources: &owned,
            resources: &resources,
            reboot_entries: &[],
            reboot_disabled: false,
            repair_entries: &[],
            repair_disabled: false,
            now: Utc::now(),
        };
        let (o, phase) = decide_ops(&input);
        let o = o.unwrap();
        assert_eq!(o.name(), "resource-apply");
        assert_eq!(phase, OperationPhase::ResourceApply);
        let targets = o.targets();
        assert_eq!(targets.len(), owned.len() + 1);
        assert_eq!(targets[0], "ServiceAccount/kube-system/cke-cluster-dns");
        assert_eq!(targets.last().unwrap(), "Namespace/app");
        for key in ["ConfigMap/kube-system/cluster-dns", "Deployment/kube-system/cluster-dns", "DaemonSet/kube-system/node-dns"] {
            assert!(targets.iter().any(|t| t == key), "{key} not applied");
        }

        for def in &owned {
            let mut annotations = BTreeMap::from([(ANNOTATION_REVISION.to_string(), def.revision.to_string())]);
            if !def.image.is_empty() {
                annotations.insert(ANNOTATION_IMAGE.to_string(), def.image.clone());
            }
            st.kubernetes
                .resource_statuses
                .insert(def.key.clone(), ResourceStatus { annotations });
        }
        let input = DecideInput { status: &st, ..input };
        let (o, _) = decide_ops(&input);
        assert_eq!(o.unwrap().targets(), vec!["Namespace/app".to_string()]);
    }

    #[test]
    fn test_stop_control_plane_containers_on_worker() {
        let c = test_cluster(1, 1);
        let mut st = converged(&c);
        let w = st.node_statuses.get_mut("10.0.1.1").unwrap();
        w.apiserver = running(Service::ApiServer, &c, &c.nodes[0]);
        w.etcd.service.running = true;
        let (o, phase) = decide(&c, &st);
        assert_eq!(o.as_deref(), Some("container-stop"));
        assert_eq!(phase, OperationPhase::StopCp);
    }

    #[test]
    fn test_reboot_queue_admission() {
        let c = test_cluster(1, 2);
        let mut st = converged(&c);
        let now = Utc::now();
        let mut entry = RebootQueueEntry {
            index: 1,
            ..RebootQueueEntry::new("10.0.1.1")
        };
        assert_eq!(
            decide_with(&c, &st, &[entry.clone()], &[]),
            (Some("reboot-drain-start".into()), OperationPhase::RebootNodes)
        );

        entry.drain_backoff_count = 1;
        entry.drain_backoff_expire = Some(now + chrono::Duration::seconds(60));
        assert_eq!(decide_with(&c, &st, &[entry.clone()], &[]).0, None);

        entry.reset_backoff();
        st.kubernetes.nodes[2].ready = false;
        assert_eq!(
            decide_with(&c, &st, &[entry.clone()], &[]),
            (None, OperationPhase::Completed)
        );

        entry.status = RebootStatus::Cancelled;
        assert_eq!(decide_with(&c, &st, &[entry], &[]).0.as_deref(), Some("reboot-dequeue"));
    }

    #[test]
    fn test_reboot_slots_and_recovery() {
        let c = test_cluster(1, 2);
        let st = converged(&c);
        let rebooting = RebootQueueEntry {
            index: 1,
            status: RebootStatus::Rebooting,
            ..RebootQueueEntry::new("10.0.1.1")
        };
        let queued = RebootQueueEntry {
            index: 2,
            ..RebootQueueEntry::new("10.0.1.2")
        };
        assert_eq!(
            decide_with(&c, &st, &[queued.clone(), rebooting.clone()], &[]).0.as_deref(),
            Some("reboot-recover")
        );
        let departed = RebootQueueEntry {
            index: 3,
            ..RebootQueueEntry::new("10.0.2.1")
        };
        assert_eq!(
            decide_with(&c, &st, &[departed], &[]).0.as_deref(),
            Some("reboot-dequeue")
        );
    }

    fn repair_cluster() -> Cluster {
        let mut c = test_cluster(1, 1);
        c.repair = serde_yaml::from_str(
            r#"
repair_procedures:
  - machine_types: ["qemu"]
    repair_operations:
      - operation: unreachable
        repair_steps:
          - repair_command: ["reset"]
            need_drain: true
            health_check_command: ["check"]
"#,
        )
        .unwrap();
        c
    }

    #[test]
    fn test_repair_queue_decisions() {
        let c = repair_cluster();
        let st = converged(&c);
        let entry = RepairQueueEntry {
            index: 1,
            ..RepairQueueEntry::new("unreachable", "qemu", "10.0.1.1", "")
        };
        assert_eq!(
            decide_with(&c, &st, &[], &[entry.clone()]),
            (Some("repair-execute".into()), OperationPhase::RepairMachines)
        );

        let watching = RepairQueueEntry {
            status: RepairStatus::Processing,
            step_status: RepairStepStatus::Watching,
            ..entry.clone()
        };
        assert_eq!(decide_with(&c, &st, &[], &[watching]).0.as_deref(), Some("repair-check"));

        let unknown = RepairQueueEntry {
            machine_type: "baremetal".into(),
            ..entry.clone()
        };
        assert_eq!(decide_with(&c, &st, &[], &[unknown]).0.as_deref(), Some("repair-fail"));

        let deleted = RepairQueueEntry {
            deleted: true,
            ..entry.clone()
        };
        assert_eq!(decide_with(&c, &st, &[], &[deleted]).0.as_deref(), Some("repair-dequeue"));

        let done = RepairQueueEntry {
            status: RepairStatus::Succeeded,
            ..entry
        };
        assert_eq!(decide_with(&c, &st, &[], &[done]), (None, OperationPhase::Completed));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let c = test_cluster(3, 3);
        let mut st = converged(&c);
        st.node_statuses.get_mut("10.0.1.2").unwrap().kubelet.service.image = "old".into();
        st.node_statuses.get_mut("10.0.1.3").unwrap().proxy = Default::default();
        let first = decide(&c, &st);
        for _ in 0..5 {
            assert_eq!(decide(&c, &st), first);
        }
        assert_eq!(first.0.as_deref(), Some("kubelet-restart"));
    }
}
