//! Node draining and local commands used by the reboot and repair queues.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cke_core::Error;
use cke_core::node::Node;
use cke_core::record::Command;
use cke_infra::k8s::EvictOutcome;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::common::WAIT_INTERVAL;
use crate::operator::{Commander, RunContext};

/// Mark nodes (un)schedulable.
pub struct Cordon {
    pub api_node: Node,
    /// Kubernetes node names.
    pub nodes: Vec<String>,
    pub unschedulable: bool,
}

#[async_trait]
impl Commander for Cordon {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        for name in &self.nodes {
            match kube.cordon(name, self.unschedulable).await {
                Ok(()) => {}
                // A node that left the cluster has nothing to uncordon.
                Err(e) if !self.unschedulable && matches!(e.downcast_ref::<Error>(), Some(Error::NotFound)) => {
                    debug!(node = %name, "node not found, skip uncordon");
                }
                Err(e) => return Err(e.context(format!("cordon {name}"))),
            }
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let name = if self.unschedulable { "cordon" } else { "uncordon" };
        Command::new(name, self.nodes.join(","))
    }
}

/// Evict every drainable pod from the nodes, retrying refused evictions until `timeout`.
pub struct EvictPods {
    pub api_node: Node,
    pub nodes: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl Commander for EvictPods {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.api_node).await?;
        let deadline = Instant::now() + self.timeout;
        loop {
            ctx.check_cancelled()?;
            let mut remaining = 0;
            for name in &self.nodes {
                for pod in kube.list_pods_on_node(name).await? {
                    match kube.evict(&pod.namespace, &pod.name).await? {
                        EvictOutcome::Evicted => {
                            info!(node = %name, pod = %format!("{}/{}", pod.namespace, pod.name), "pod evicted")
                        }
                        EvictOutcome::Gone => {}
                        EvictOutcome::Blocked => {
                            debug!(pod = %format!("{}/{}", pod.namespace, pod.name), "eviction refused");
                            remaining += 1;
                        }
                    }
                }
            }
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::transient(format!(
                    "{remaining} pods could not be evicted from {}",
                    self.nodes.join(",")
                ))
                .into());
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = sleep(WAIT_INTERVAL) => {}
            }
        }
    }

    fn command(&self) -> Command {
        Command::new("evict-pods", self.nodes.join(","))
    }
}

/// Run a configured command on the CKE host with the node address appended.
///
/// With `expect_true`, the command must also print `true`.
pub struct RunLocalCommand {
    pub argv: Vec<String>,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub expect_true: bool,
}

#[async_trait]
impl Commander for RunLocalCommand {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        if self.argv.is_empty() {
            return Err(Error::bad_request("command is not configured").into());
        }
        let out = ctx.infra.local().run(&self.argv, &self.args, self.timeout).await?;
        if self.expect_true && out.trim() != "true" {
            return Err(Error::transient(format!("{} did not report true", self.argv[0])).into());
        }
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("run-local-command", self.args.join(",")).with_detail(self.argv.join(" "))
    }
}
