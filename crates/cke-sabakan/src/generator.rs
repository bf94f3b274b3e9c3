//! Cluster generation from inventory machines and a template cluster.
//!
//! The template holds exactly one control-plane node and one or more worker
//! nodes; every generated node is a copy of one of them with the address,
//! labels and annotations of its machine. Regeneration keeps the current node
//! set where it can, so a healthy fleet yields the same cluster every time.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use cke_core::Error;
use cke_core::cluster::Cluster;
use cke_core::constraints::Constraints;
use cke_core::node::{Node, Taint};

use crate::machine::{Machine, MachineState};

pub const LABEL_ROLE: &str = "cke.cybozu.com/role";
pub const LABEL_WEIGHT: &str = "cke.cybozu.com/weight";
pub const LABEL_RACK: &str = "cke.cybozu.com/rack";
pub const LABEL_INDEX_IN_RACK: &str = "cke.cybozu.com/index-in-rack";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const ANNOTATION_SERIAL: &str = "cke.cybozu.com/serial";
pub const ANNOTATION_REGISTER_DATE: &str = "cke.cybozu.com/register-date";
pub const ANNOTATION_RETIRE_DATE: &str = "cke.cybozu.com/retire-date";
pub const TAINT_STATE: &str = "cke.cybozu.com/state";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template must have exactly one control plane node, found {0}")]
    ControlPlaneCount(usize),
    #[error("template has no worker node")]
    NoWorker,
    #[error("worker template node has no {LABEL_ROLE} label")]
    MissingRole,
    #[error("worker role {0:?} appears in more than one template node")]
    DuplicateRole(String),
    #[error("invalid {LABEL_WEIGHT} label {0:?}")]
    InvalidWeight(String),
}

struct WorkerTemplate<'a> {
    node: &'a Node,
    role: Option<&'a str>,
    weight: f64,
}

/// Structural checks of a template cluster; used before storing one.
pub fn validate_template(template: &Cluster) -> Result<(), TemplateError> {
    split_template(template).map(|_| ())
}

fn split_template(template: &Cluster) -> Result<(&Node, Vec<WorkerTemplate<'_>>), TemplateError> {
    let cps: Vec<&Node> = template.nodes.iter().filter(|n| n.control_plane).collect();
    let [cp] = cps.as_slice() else {
        return Err(TemplateError::ControlPlaneCount(cps.len()));
    };
    let worker_nodes: Vec<&Node> = template.nodes.iter().filter(|n| !n.control_plane).collect();
    if worker_nodes.is_empty() {
        return Err(TemplateError::NoWorker);
    }

    let mut roles = HashSet::new();
    let mut workers = Vec::new();
    for node in worker_nodes.iter().copied() {
        let role = node.labels.get(LABEL_ROLE).map(String::as_str);
        if worker_nodes.len() > 1 {
            let r = role.ok_or(TemplateError::MissingRole)?;
            if !roles.insert(r) {
                return Err(TemplateError::DuplicateRole(r.to_string()));
            }
        }
        let weight = match node.labels.get(LABEL_WEIGHT) {
            None => 1.0,
            Some(w) => match w.parse::<f64>() {
                Ok(v) if v > 0.0 && v.is_finite() => v,
                _ => return Err(TemplateError::InvalidWeight(w.clone())),
            },
        };
        workers.push(WorkerTemplate { node, role, weight });
    }
    Ok((*cp, workers))
}

/// A node of the cluster being built.
#[derive(Clone)]
struct Member<'a> {
    machine: &'a Machine,
    control_plane: bool,
}

pub struct ClusterGenerator<'a> {
    template: &'a Cluster,
    cp_template: &'a Node,
    workers: Vec<WorkerTemplate<'a>>,
    constraints: &'a Constraints,
    machines: Vec<&'a Machine>,
    by_address: HashMap<&'a str, &'a Machine>,
}

impl<'a> ClusterGenerator<'a> {
    pub fn new(template: &'a Cluster, constraints: &'a Constraints, machines: &'a [Machine]) -> Result<Self, TemplateError> {
        let (cp_template, workers) = split_template(template)?;
        let mut sorted: Vec<&Machine> = machines.iter().filter(|m| m.address().is_some()).collect();
        sorted.sort_by(|a, b| {
            (a.spec.rack, a.spec.index_in_rack, a.address()).cmp(&(b.spec.rack, b.spec.index_in_rack, b.address()))
        });
        let by_address = sorted
            .iter()
            .filter_map(|&m| m.address().map(|a| (a, m)))
            .collect();
        Ok(Self {
            template,
            cp_template,
            workers,
            constraints,
            machines: sorted,
            by_address,
        })
    }

    /// A cluster built from scratch.
    pub fn generate(&self) -> Result<Cluster> {
        self.build(Vec::new())
    }

    /// The cluster regenerated from `current`, or `None` when nothing changes.
    pub fn update(&self, current: &Cluster) -> Result<Option<Cluster>> {
        let members = current
            .nodes
            .iter()
            .filter_map(|n| {
                let machine = *self.by_address.get(n.address.as_str())?;
                (!machine.state().is_leaving()).then_some(Member {
                    machine,
                    control_plane: n.control_plane,
                })
            })
            .collect();
        let next = self.build(members)?;
        Ok((next != *current).then_some(next))
    }

    /// Generated workers per role.
    pub fn worker_counts(&self, cluster: &Cluster) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .workers
            .iter()
            .map(|w| (w.role.unwrap_or_default().to_string(), 0))
            .collect();
        for n in cluster.nodes.iter().filter(|n| !n.control_plane) {
            let role = match self.workers.as_slice() {
                [single] => single.role.unwrap_or_default(),
                _ => n.labels.get(LABEL_ROLE).map(String::as_str).unwrap_or_default(),
            };
            *counts.entry(role.to_string()).or_default() += 1;
        }
        counts
    }

    /// Healthy machines that are not part of `cluster`.
    pub fn unused_count(&self, cluster: &Cluster) -> usize {
        let used: HashSet<&str> = cluster.nodes.iter().map(|n| n.address.as_str()).collect();
        self.machines
            .iter()
            .filter(|m| m.state().is_usable() && m.address().is_some_and(|a| !used.contains(a)))
            .count()
    }

    fn worker_template(&self, machine: &Machine) -> Option<&WorkerTemplate<'a>> {
        match self.workers.as_slice() {
            [single] if single.role.is_none_or(|r| r == machine.spec.role) => Some(single),
            _ => self.workers.iter().find(|w| w.role == Some(machine.spec.role.as_str())),
        }
    }

    fn cp_eligible(&self, machine: &Machine) -> bool {
        self.cp_template
            .labels
            .get(LABEL_ROLE)
            .is_none_or(|r| *r == machine.spec.role)
    }

    fn build(&self, mut members: Vec<Member<'a>>) -> Result<Cluster> {
        self.fill_control_planes(&mut members)?;
        members.retain(|m| m.control_plane || self.worker_template(m.machine).is_some());
        self.fill_workers(&mut members);

        let nodes = members
            .iter()
            .map(|m| {
                let template = if m.control_plane {
                    self.cp_template
                } else {
                    self.worker_template(m.machine).map_or(self.cp_template, |w| w.node)
                };
                node_from(template, m.machine, m.control_plane)
            })
            .collect();
        Ok(Cluster {
            nodes,
            ..self.template.clone()
        })
    }

    fn fill_control_planes(&self, members: &mut Vec<Member<'a>>) -> Result<()> {
        let desired = self.constraints.control_plane_count;
        let mut kept = 0;
        let mut weak = Vec::new();
        for (i, m) in members.iter_mut().enumerate() {
            if !m.control_plane {
                continue;
            }
            let good = matches!(m.machine.state(), MachineState::Healthy | MachineState::Updating);
            if good && kept < desired {
                kept += 1;
            } else {
                m.control_plane = false;
                if !good {
                    weak.push(i);
                }
            }
        }

        while kept < desired {
            if let Some(machine) = self.pick_control_plane(members.as_slice()) {
                match members.iter_mut().find(|m| m.machine.address() == machine.address()) {
                    Some(m) => m.control_plane = true,
                    None => members.push(Member {
                        machine,
                        control_plane: true,
                    }),
                }
            } else if let Some(i) = weak.pop() {
                members[i].control_plane = true;
            } else {
                return Err(Error::bad_request(format!(
                    "not enough healthy machines for {desired} control planes"
                ))
                .into());
            }
            kept += 1;
        }
        Ok(())
    }

    /// Healthy machine for a new control plane, in the rack with the fewest of them.
    ///
    /// Unused machines are preferred over promoting a current worker.
    fn pick_control_plane(&self, members: &[Member<'a>]) -> Option<&'a Machine> {
        let mut per_rack: HashMap<u32, usize> = HashMap::new();
        for m in members.iter().filter(|m| m.control_plane) {
            *per_rack.entry(m.machine.spec.rack).or_default() += 1;
        }
        let in_use: HashMap<&str, bool> = members
            .iter()
            .filter_map(|m| m.machine.address().map(|a| (a, m.control_plane)))
            .collect();
        self.machines
            .iter()
            .filter(|m| m.state().is_usable() && self.cp_eligible(m))
            .filter(|m| m.address().is_some_and(|a| in_use.get(a) != Some(&true)))
            .min_by_key(|m| {
                let is_worker = m.address().is_some_and(|a| in_use.contains_key(a));
                (per_rack.get(&m.spec.rack).copied().unwrap_or(0), is_worker)
            })
            .copied()
    }

    fn fill_workers(&self, members: &mut Vec<Member<'a>>) {
        let used: HashSet<&str> = members.iter().filter_map(|m| m.machine.address()).collect();
        let available = self
            .machines
            .iter()
            .filter(|m| m.state().is_usable() && self.worker_template(m).is_some())
            .filter(|m| {
                m.address()
                    .is_some_and(|a| !used.contains(a) || members.iter().any(|x| !x.control_plane && x.machine.address() == Some(a)))
            })
            .count();
        let by_rate = (available * self.constraints.minimum_workers_rate).div_ceil(100);
        let maximum = match self.constraints.maximum_workers {
            0 => usize::MAX,
            n => n,
        };
        let minimum = self.constraints.minimum_workers.max(by_rate).min(maximum);

        let healthy_workers = |members: &[Member<'_>]| {
            members
                .iter()
                .filter(|m| !m.control_plane && m.machine.state().is_usable())
                .count()
        };
        while healthy_workers(members.as_slice()) < minimum {
            let Some(machine) = self.pick_worker(members.as_slice()) else {
                break;
            };
            members.push(Member {
                machine,
                control_plane: false,
            });
        }

        let mut workers = members.iter().filter(|m| !m.control_plane).count();
        while workers > maximum {
            let victim = members
                .iter()
                .rposition(|m| !m.control_plane && !m.machine.state().is_usable())
                .or_else(|| members.iter().rposition(|m| !m.control_plane));
            let Some(i) = victim else {
                break;
            };
            members.remove(i);
            workers -= 1;
        }
    }

    /// Unused healthy machine for the role furthest below its weighted share.
    fn pick_worker(&self, members: &[Member<'a>]) -> Option<&'a Machine> {
        let used: HashSet<&str> = members.iter().filter_map(|m| m.machine.address()).collect();
        let mut per_role: HashMap<Option<&str>, usize> = HashMap::new();
        let mut per_rack: HashMap<u32, usize> = HashMap::new();
        for m in members.iter().filter(|m| !m.control_plane) {
            if let Some(w) = self.worker_template(m.machine) {
                *per_role.entry(w.role).or_default() += 1;
            }
            *per_rack.entry(m.machine.spec.rack).or_default() += 1;
        }

        let mut templates: Vec<&WorkerTemplate<'a>> = self.workers.iter().collect();
        templates.sort_by(|a, b| {
            let sa = per_role.get(&a.role).copied().unwrap_or(0) as f64 / a.weight;
            let sb = per_role.get(&b.role).copied().unwrap_or(0) as f64 / b.weight;
            sa.total_cmp(&sb)
        });
        templates.into_iter().find_map(|t| {
            self.machines
                .iter()
                .filter(|m| m.state().is_usable())
                .filter(|m| m.address().is_some_and(|a| !used.contains(a)))
                .filter(|m| self.worker_template(m).is_some_and(|w| w.role == t.role))
                .min_by_key(|m| per_rack.get(&m.spec.rack).copied().unwrap_or(0))
                .copied()
        })
    }
}

fn node_from(template: &Node, machine: &Machine, control_plane: bool) -> Node {
    let spec = &machine.spec;
    let mut node = Node {
        address: machine.address().unwrap_or_default().to_string(),
        control_plane,
        signer: None,
        ..template.clone()
    };
    node.labels.remove(LABEL_WEIGHT);
    node.labels.insert(LABEL_RACK.into(), spec.rack.to_string());
    node.labels.insert(LABEL_INDEX_IN_RACK.into(), spec.index_in_rack.to_string());
    node.labels.insert(LABEL_ZONE.into(), format!("rack{}", spec.rack));
    if !spec.role.is_empty() {
        node.labels.insert(LABEL_ROLE.into(), spec.role.clone());
        node.labels
            .insert(format!("node-role.kubernetes.io/{}", spec.role), "true".into());
    }
    node.annotations.insert(ANNOTATION_SERIAL.into(), spec.serial.clone());
    if let Some(d) = spec.register_date {
        node.annotations.insert(ANNOTATION_REGISTER_DATE.into(), d.to_rfc3339());
    }
    if let Some(d) = spec.retire_date {
        node.annotations.insert(ANNOTATION_RETIRE_DATE.into(), d.to_rfc3339());
    }
    let effect = match machine.state() {
        MachineState::Unhealthy => Some("NoSchedule"),
        MachineState::Unreachable => Some("NoExecute"),
        _ => None,
    };
    if let Some(effect) = effect {
        node.taints.push(Taint {
            key: TAINT_STATE.into(),
            value: machine.state().as_str().into(),
            effect: effect.into(),
        });
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::machine;

    fn template(worker_roles: &[(&str, &str)]) -> Cluster {
        let mut yaml = String::from(
            "name: tmpl\nservice_subnet: 10.68.0.0/16\nnodes:\n  - user: cybozu\n    control_plane: true\n    labels:\n      cke.cybozu.com/role: cs\n",
        );
        if worker_roles.is_empty() {
            yaml.push_str("  - user: cybozu\n");
        }
        for (role, weight) in worker_roles {
            yaml.push_str(&format!(
                "  - user: cybozu\n    labels:\n      cke.cybozu.com/role: {role}\n      cke.cybozu.com/weight: \"{weight}\"\n"
            ));
        }
        Cluster::from_yaml(&yaml).unwrap()
    }

    fn constraints(cps: usize, min_workers: usize, max_workers: usize) -> Constraints {
        Constraints {
            control_plane_count: cps,
            minimum_workers: min_workers,
            minimum_workers_rate: 0,
            maximum_workers: max_workers,
            ..Default::default()
        }
    }

    fn fleet(n: u32, racks: u32) -> Vec<Machine> {
        (0..n)
            .map(|i| machine(&format!("10.0.{}.{}", i % racks, i + 1), i % racks, "cs", MachineState::Healthy))
            .collect()
    }

    fn cps(c: &Cluster) -> Vec<&str> {
        c.nodes.iter().filter(|n| n.control_plane).map(|n| n.address.as_str()).collect()
    }

    #[test]
    fn test_template_validation() {
        let mut t = template(&[]);
        assert!(validate_template(&t).is_ok());
        t.nodes[0].control_plane = false;
        assert_eq!(validate_template(&t), Err(TemplateError::ControlPlaneCount(0)));

        let mut t = template(&[("cs", "1"), ("ss", "2")]);
        assert!(validate_template(&t).is_ok());
        t.nodes[2].labels.insert(LABEL_ROLE.into(), "cs".into());
        assert_eq!(validate_template(&t), Err(TemplateError::DuplicateRole("cs".into())));

        let t = template(&[("cs", "0")]);
        assert_eq!(validate_template(&t), Err(TemplateError::InvalidWeight("0".into())));
    }

    #[test]
    fn test_generate_spreads_control_planes_across_racks() {
        let t = template(&[]);
        let c = constraints(3, 2, 0);
        let machines = fleet(9, 3);
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();

        let racks: HashSet<&str> = cluster
            .nodes
            .iter()
            .filter(|n| n.control_plane)
            .map(|n| n.labels[LABEL_RACK].as_str())
            .collect();
        assert_eq!(racks.len(), 3);
        assert_eq!(cluster.nodes.iter().filter(|n| !n.control_plane).count(), 2);
        assert_eq!(cluster.name, "tmpl");
        let n = &cluster.nodes[0];
        assert_eq!(n.labels["node-role.kubernetes.io/cs"], "true");
        assert!(n.annotations[ANNOTATION_SERIAL].starts_with("serial-"));
        assert_eq!(g.unused_count(&cluster), 4);
    }

    #[test]
    fn test_update_is_stable_for_healthy_fleet() {
        let t = template(&[]);
        let c = constraints(1, 2, 0);
        let machines = fleet(5, 1);
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        assert_eq!(g.update(&cluster).unwrap(), None);
    }

    #[test]
    fn test_update_replaces_retired_and_unhealthy_control_plane() {
        let t = template(&[]);
        let c = constraints(1, 1, 0);
        let mut machines = fleet(4, 2);
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        let cp = cps(&cluster)[0].to_string();
        let worker = cluster.nodes.iter().find(|n| !n.control_plane).unwrap().address.clone();

        for m in &mut machines {
            if m.address() == Some(cp.as_str()) {
                m.status.state = MachineState::Unreachable;
            }
            if m.address() == Some(worker.as_str()) {
                m.status.state = MachineState::Retired;
            }
        }
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let next = g.update(&cluster).unwrap().unwrap();
        let next_cp = cps(&next);
        assert_eq!(next_cp.len(), 1);
        assert_ne!(next_cp[0], cp);
        assert!(next.node(&worker).is_none());
        let demoted = next.node(&cp).unwrap();
        assert!(!demoted.control_plane);
        assert_eq!(demoted.taints[0].effect, "NoExecute");
    }

    #[test]
    fn test_keeps_weak_control_plane_without_replacement() {
        let t = template(&[]);
        let c = constraints(1, 0, 0);
        let mut machines = fleet(1, 1);
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        machines[0].status.state = MachineState::Unhealthy;
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let next = g.update(&cluster).unwrap().unwrap();
        assert_eq!(cps(&next), vec!["10.0.0.1"]);
        assert_eq!(next.nodes[0].taints[0].value, "unhealthy");
    }

    #[test]
    fn test_not_enough_machines() {
        let t = template(&[]);
        let c = constraints(3, 0, 0);
        let machines = fleet(2, 2);
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        assert!(g.generate().is_err());
    }

    #[test]
    fn test_worker_bounds() {
        let t = template(&[]);
        let machines = fleet(10, 2);

        let c = Constraints {
            minimum_workers_rate: 50,
            ..constraints(1, 1, 0)
        };
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        assert_eq!(cluster.nodes.len(), 1 + 5);

        let c = Constraints {
            minimum_workers_rate: 100,
            ..constraints(1, 1, 3)
        };
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        assert_eq!(g.worker_counts(&cluster)[""], 3);
    }

    #[test]
    fn test_roles_follow_weights() {
        let t = template(&[("cs", "1"), ("ss", "2")]);
        let c = constraints(1, 6, 0);
        let mut machines = fleet(6, 2);
        for i in 0..6u32 {
            machines.push(machine(&format!("10.0.9.{}", i + 1), i % 2, "ss", MachineState::Healthy));
        }
        let g = ClusterGenerator::new(&t, &c, &machines).unwrap();
        let cluster = g.generate().unwrap();
        let counts = g.worker_counts(&cluster);
        assert_eq!(counts["cs"], 2);
        assert_eq!(counts["ss"], 4);
    }
}
