//! Bootstrap and restart of rivers and the Kubernetes components.

use std::time::Duration;

use cke_core::cluster::Cluster;
use cke_core::node::Node;

use crate::certs::{IssueCertificates, MakeKubeconfig, kubeconfig_identity};
use crate::common::{ImagePull, MakeDirs, RunContainer, WaitKubernetes, addrs_of};
use crate::operator::{Commander, Sequence};
use crate::service::Service;

pub const APISERVER_BOOT_TIMEOUT: Duration = Duration::from_secs(300);

fn has_files(svc: Service) -> bool {
    !matches!(svc, Service::Rivers | Service::Scheduler | Service::Proxy)
}

/// Steps that (re)start `svc` on `nodes`: files, image, directories, container.
pub fn start_steps(cluster: &Cluster, svc: Service, nodes: &[Node]) -> Vec<Box<dyn Commander>> {
    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    if has_files(svc) {
        steps.push(Box::new(IssueCertificates {
            service: svc,
            nodes: nodes.to_vec(),
        }));
    }
    if nodes.first().is_some_and(|n| kubeconfig_identity(svc, n).is_some()) {
        steps.push(Box::new(MakeKubeconfig {
            service: svc,
            nodes: nodes.to_vec(),
        }));
    }
    steps.push(Box::new(ImagePull {
        nodes: nodes.to_vec(),
        image: svc.image().to_string(),
    }));
    let dirs = svc.dirs();
    if !dirs.is_empty() {
        steps.push(Box::new(MakeDirs {
            nodes: nodes.to_vec(),
            dirs,
        }));
    }
    steps.push(Box::new(RunContainer::new(cluster, svc, nodes)));
    if svc == Service::ApiServer {
        if let Some(first) = nodes.first() {
            steps.push(Box::new(WaitKubernetes {
                node: first.clone(),
                timeout: APISERVER_BOOT_TIMEOUT,
            }));
        }
    }
    steps
}

/// Start `svc` where it is not running.
pub fn bootstrap_op(cluster: &Cluster, svc: Service, nodes: &[Node]) -> Sequence {
    Sequence::new(
        format!("{}-bootstrap", svc.name()),
        addrs_of(nodes),
        start_steps(cluster, svc, nodes),
    )
}

/// Replace outdated instances of `svc`.
pub fn restart_op(cluster: &Cluster, svc: Service, nodes: &[Node]) -> Sequence {
    Sequence::new(
        format!("{}-restart", svc.name()),
        addrs_of(nodes),
        start_steps(cluster, svc, nodes),
    )
}
