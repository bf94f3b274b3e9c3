use cke_core::node::Node;

use crate::common::StopContainer;
use crate::operator::{Commander, Sequence};
use crate::service::Service;

/// Stop control-plane containers still running on a node that is no longer a control plane.
pub fn stop_op(node: &Node, services: &[Service]) -> Sequence {
    let steps = services
        .iter()
        .map(|svc| {
            Box::new(StopContainer {
                nodes: vec![node.clone()],
                name: svc.name().to_string(),
            }) as Box<dyn Commander>
        })
        .collect();
    Sequence::new("container-stop", vec![node.address.clone()], steps)
}
