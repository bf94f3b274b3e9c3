//! Reboot queue operators.
//!
//! An entry moves `queued -> draining -> rebooting` inside one drain-start
//! operation, then `reboot-recover` dequeues it once the boot check passes.
//! Cancelled entries are dequeued by `reboot-dequeue`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::cluster::RebootConfig;
use cke_core::node::Node;
use cke_core::reboot::{RebootQueueEntry, RebootStatus};
use cke_core::record::Command;
use tracing::{info, warn};

use crate::drain::{Cordon, EvictPods, RunLocalCommand};
use crate::operator::{Commander, Operator, RunContext, Sequence};

pub struct UpdateRebootEntry {
    pub entry: RebootQueueEntry,
    pub status: RebootStatus,
}

#[async_trait]
impl Commander for UpdateRebootEntry {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let storage = ctx.infra.storage();
        let mut entry = storage
            .get_reboot_entry(self.entry.index)
            .await
            .with_context(|| format!("read reboot entry {}", self.entry.index))?;
        if entry.status == RebootStatus::Cancelled && self.status != RebootStatus::Cancelled {
            return Err(Error::Conflicted(format!("reboot entry {} was cancelled", entry.index)).into());
        }
        entry.transition(self.status, ctx.now);
        storage
            .update_reboot_entry(Some(ctx.leader), &entry)
            .await
            .with_context(|| format!("update reboot entry {}", entry.index))
    }

    fn command(&self) -> Command {
        Command::new("update-reboot-entry", self.entry.node.clone()).with_detail(self.status.to_string())
    }
}

pub struct DequeueRebootEntry {
    pub entry: RebootQueueEntry,
}

#[async_trait]
impl Commander for DequeueRebootEntry {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        ctx.infra
            .storage()
            .delete_reboot_entry(ctx.leader, self.entry.index)
            .await
            .with_context(|| format!("dequeue reboot entry {}", self.entry.index))?;
        info!(node = %self.entry.node, index = self.entry.index, "reboot entry dequeued");
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("dequeue-reboot-entry", self.entry.node.clone()).with_detail(self.entry.index.to_string())
    }
}

/// Drain the node of a queued entry and run the reboot command.
///
/// A failure while draining puts the entry back in the queue with a longer
/// backoff and uncordons the node.
pub struct RebootDrainStartOp {
    api_node: Node,
    entry: RebootQueueEntry,
    nodename: String,
    config: RebootConfig,
    issued: usize,
}

/// Steps up to and including `evict-pods`.
const DRAIN_STEPS: usize = 3;

impl RebootDrainStartOp {
    pub fn new(api_node: &Node, entry: RebootQueueEntry, nodename: &str, config: &RebootConfig) -> Self {
        Self {
            api_node: api_node.clone(),
            entry,
            nodename: nodename.to_string(),
            config: config.clone(),
            issued: 0,
        }
    }

    fn cordon(&self, unschedulable: bool) -> Cordon {
        Cordon {
            api_node: self.api_node.clone(),
            nodes: vec![self.nodename.clone()],
            unschedulable,
        }
    }
}

#[async_trait]
impl Operator for RebootDrainStartOp {
    fn name(&self) -> String {
        "reboot-drain-start".into()
    }

    fn targets(&self) -> Vec<String> {
        vec![self.entry.node.clone()]
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step: Box<dyn Commander> = match self.issued {
            0 => Box::new(UpdateRebootEntry {
                entry: self.entry.clone(),
                status: RebootStatus::Draining,
            }),
            1 => Box::new(self.cordon(true)),
            2 => Box::new(EvictPods {
                api_node: self.api_node.clone(),
                nodes: vec![self.nodename.clone()],
                timeout: Duration::from_secs(self.config.eviction_timeout_seconds),
            }),
            3 => Box::new(UpdateRebootEntry {
                entry: self.entry.clone(),
                status: RebootStatus::Rebooting,
            }),
            4 => Box::new(RunLocalCommand {
                argv: self.config.reboot_command.clone(),
                args: vec![self.entry.node.clone()],
                timeout: Duration::from_secs(self.config.command_timeout_seconds),
                expect_true: false,
            }),
            _ => return None,
        };
        self.issued += 1;
        Some(step)
    }

    async fn cleanup(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        if self.issued > DRAIN_STEPS {
            // The reboot command itself failed; recovery decides what happens next.
            return Ok(());
        }
        let storage = ctx.infra.storage();
        let mut entry = storage
            .get_reboot_entry(self.entry.index)
            .await
            .context("read reboot entry")?;
        if entry.status == RebootStatus::Cancelled {
            info!(node = %entry.node, "reboot cancelled while draining");
        } else {
            entry.record_drain_failure(ctx.now);
            warn!(
                node = %entry.node,
                backoff_count = entry.drain_backoff_count,
                "drain failed, entry requeued"
            );
            storage
                .update_reboot_entry(Some(ctx.leader), &entry)
                .await
                .context("record drain failure")?;
        }
        self.cordon(false).run(ctx).await
    }
}

/// Uncordon a rebooted node once the boot check passes, then dequeue it.
pub fn recover_op(api_node: &Node, entry: &RebootQueueEntry, nodename: &str, config: &RebootConfig) -> Sequence {
    Sequence::new(
        "reboot-recover",
        vec![entry.node.clone()],
        vec![
            Box::new(RunLocalCommand {
                argv: config.boot_check_command.clone(),
                args: vec![entry.node.clone()],
                timeout: Duration::from_secs(config.command_timeout_seconds),
                expect_true: true,
            }),
            Box::new(Cordon {
                api_node: api_node.clone(),
                nodes: vec![nodename.to_string()],
                unschedulable: false,
            }),
            Box::new(DequeueRebootEntry { entry: entry.clone() }),
        ],
    )
}

/// Remove a cancelled entry, uncordoning its node if it is still a member.
pub fn dequeue_op(api_node: &Node, entry: &RebootQueueEntry, nodename: Option<&str>) -> Sequence {
    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    if let Some(name) = nodename {
        steps.push(Box::new(Cordon {
            api_node: api_node.clone(),
            nodes: vec![name.to_string()],
            unschedulable: false,
        }));
    }
    steps.push(Box::new(DequeueRebootEntry { entry: entry.clone() }));
    Sequence::new("reboot-dequeue", vec![entry.node.clone()], steps)
}
