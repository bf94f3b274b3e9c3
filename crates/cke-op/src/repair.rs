//! Repair queue operators.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::cluster::RepairStep;
use cke_core::node::Node;
use cke_core::record::Command;
use cke_core::repair::{RepairQueueEntry, RepairStatus, RepairStepStatus};
use tracing::{debug, info, warn};

use crate::drain::{Cordon, EvictPods, RunLocalCommand};
use crate::operator::{Commander, Operator, RunContext, Sequence};

pub struct UpdateRepairEntry {
    pub entry: RepairQueueEntry,
    pub status: RepairStatus,
    pub step: usize,
    pub step_status: RepairStepStatus,
}

impl UpdateRepairEntry {
    fn new(entry: &RepairQueueEntry, status: RepairStatus, step_status: RepairStepStatus) -> Self {
        Self {
            entry: entry.clone(),
            status,
            step: entry.step,
            step_status,
        }
    }
}

#[async_trait]
impl Commander for UpdateRepairEntry {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let storage = ctx.infra.storage();
        let mut entry = storage
            .get_repair_entry(self.entry.index)
            .await
            .with_context(|| format!("read repair entry {}", self.entry.index))?;
        if entry.deleted {
            return Err(Error::Conflicted(format!("repair entry {} was deleted", entry.index)).into());
        }
        entry.step = self.step;
        entry.transition(self.status, self.step_status, ctx.now);
        storage
            .update_repair_entry(Some(ctx.leader), &entry)
            .await
            .with_context(|| format!("update repair entry {}", entry.index))
    }

    fn command(&self) -> Command {
        Command::new("update-repair-entry", self.entry.address.clone()).with_detail(format!(
            "{} step {} {}",
            self.status, self.step, self.step_status
        ))
    }
}

pub struct DequeueRepairEntry {
    pub entry: RepairQueueEntry,
}

#[async_trait]
impl Commander for DequeueRepairEntry {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        ctx.infra
            .storage()
            .delete_repair_entry(Some(ctx.leader), self.entry.index)
            .await
            .with_context(|| format!("dequeue repair entry {}", self.entry.index))?;
        info!(address = %self.entry.address, index = self.entry.index, "repair entry dequeued");
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("dequeue-repair-entry", self.entry.address.clone()).with_detail(self.entry.index.to_string())
    }
}

fn uncordon(api_node: &Node, entry: &RepairQueueEntry) -> Option<Cordon> {
    entry.is_in_cluster().then(|| Cordon {
        api_node: api_node.clone(),
        nodes: vec![entry.nodename.clone()],
        unschedulable: false,
    })
}

/// Run the current step of an entry: optional drain, the repair command, then watch.
pub struct RepairExecuteOp {
    api_node: Node,
    entry: RepairQueueEntry,
    steps: VecDeque<Box<dyn Commander>>,
    drains: bool,
    issued: usize,
}

impl RepairExecuteOp {
    pub fn new(api_node: &Node, entry: &RepairQueueEntry, step: &RepairStep, evict_timeout: Duration) -> Self {
        let drains = step.need_drain && entry.is_in_cluster();
        let first = if drains {
            RepairStepStatus::Draining
        } else {
            RepairStepStatus::Waiting
        };
        let mut steps: VecDeque<Box<dyn Commander>> = VecDeque::new();
        steps.push_back(Box::new(UpdateRepairEntry::new(entry, RepairStatus::Processing, first)));
        if drains {
            steps.push_back(Box::new(Cordon {
                api_node: api_node.clone(),
                nodes: vec![entry.nodename.clone()],
                unschedulable: true,
            }));
            steps.push_back(Box::new(EvictPods {
                api_node: api_node.clone(),
                nodes: vec![entry.nodename.clone()],
                timeout: evict_timeout,
            }));
        }
        steps.push_back(Box::new(RunLocalCommand {
            argv: step.repair_command.clone(),
            args: vec![entry.address.clone()],
            timeout: Duration::from_secs(step.command_timeout_seconds),
            expect_true: false,
        }));
        steps.push_back(Box::new(UpdateRepairEntry::new(
            entry,
            RepairStatus::Processing,
            RepairStepStatus::Watching,
        )));
        Self {
            api_node: api_node.clone(),
            entry: entry.clone(),
            steps,
            drains,
            issued: 0,
        }
    }
}

#[async_trait]
impl Operator for RepairExecuteOp {
    fn name(&self) -> String {
        "repair-execute".into()
    }

    fn targets(&self) -> Vec<String> {
        vec![self.entry.address.clone()]
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.steps.pop_front()?;
        self.issued += 1;
        Some(step)
    }

    async fn cleanup(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        if self.issued <= 1 {
            return Ok(());
        }
        let storage = ctx.infra.storage();
        let mut entry = storage
            .get_repair_entry(self.entry.index)
            .await
            .context("read repair entry")?;
        if entry.deleted {
            // Dequeueing uncordons the node.
            info!(address = %entry.address, "repair entry deleted while running");
            return Ok(());
        }
        if self.drains && self.issued <= 3 {
            entry.record_drain_failure(ctx.now);
            warn!(
                address = %entry.address,
                backoff_count = entry.drain_backoff_count,
                "drain for repair failed"
            );
            storage
                .update_repair_entry(Some(ctx.leader), &entry)
                .await
                .context("record drain failure")?;
            if let Some(c) = uncordon(&self.api_node, &entry) {
                c.run(ctx).await?;
            }
            return Ok(());
        }
        entry.transition(RepairStatus::Failed, entry.step_status, ctx.now);
        warn!(address = %entry.address, step = entry.step, "repair command failed");
        storage
            .update_repair_entry(Some(ctx.leader), &entry)
            .await
            .context("mark repair failed")
    }
}

/// Poll the health check of a watching entry.
///
/// Healthy finishes the entry. Past the watch period it moves on to the next
/// step, or fails when none is left. Otherwise nothing changes.
pub struct CheckRepairHealth {
    pub api_node: Node,
    pub entry: RepairQueueEntry,
    pub step: RepairStep,
    pub total_steps: usize,
}

impl CheckRepairHealth {
    async fn healthy(&self, ctx: &RunContext<'_>) -> bool {
        if self.step.health_check_command.is_empty() {
            return false;
        }
        let timeout = Duration::from_secs(self.step.command_timeout_seconds);
        match ctx
            .infra
            .local()
            .run(&self.step.health_check_command, &[self.entry.address.clone()], timeout)
            .await
        {
            Ok(out) => out.trim() == "true",
            Err(e) => {
                debug!(address = %self.entry.address, error = %format!("{e:#}"), "health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Commander for CheckRepairHealth {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let mut entry = self.entry.clone();
        if self.healthy(ctx).await {
            if let Some(c) = uncordon(&self.api_node, &entry) {
                c.run(ctx).await?;
            }
            entry.transition(RepairStatus::Succeeded, RepairStepStatus::Watching, ctx.now);
            info!(address = %entry.address, "repair succeeded");
        } else {
            let since = entry.last_transition_time.unwrap_or(ctx.now);
            let watched = ctx.now.signed_duration_since(since).num_seconds();
            if watched < i64::try_from(self.step.watch_seconds).unwrap_or(i64::MAX) {
                return Ok(());
            }
            if entry.step + 1 < self.total_steps {
                entry.step += 1;
                entry.transition(RepairStatus::Processing, RepairStepStatus::Waiting, ctx.now);
                info!(address = %entry.address, step = entry.step, "repair step timed out, trying next step");
            } else {
                entry.transition(RepairStatus::Failed, RepairStepStatus::Watching, ctx.now);
                warn!(address = %entry.address, "repair timed out on the last step");
            }
        }
        ctx.infra
            .storage()
            .update_repair_entry(Some(ctx.leader), &entry)
            .await
            .with_context(|| format!("update repair entry {}", entry.index))
    }

    fn command(&self) -> Command {
        Command::new("check-repair-health", self.entry.address.clone()).with_detail(format!("step {}", self.entry.step))
    }
}

pub fn check_op(api_node: &Node, entry: &RepairQueueEntry, step: &RepairStep, total_steps: usize) -> Sequence {
    Sequence::new(
        "repair-check",
        vec![entry.address.clone()],
        vec![Box::new(CheckRepairHealth {
            api_node: api_node.clone(),
            entry: entry.clone(),
            step: step.clone(),
            total_steps,
        })],
    )
}

/// Fail an entry whose procedure cannot be found.
pub fn fail_op(entry: &RepairQueueEntry) -> Sequence {
    Sequence::new(
        "repair-fail",
        vec![entry.address.clone()],
        vec![Box::new(UpdateRepairEntry::new(
            entry,
            RepairStatus::Failed,
            entry.step_status,
        ))],
    )
}

/// Remove an entry marked deleted, uncordoning its node first.
pub fn dequeue_op(api_node: &Node, entry: &RepairQueueEntry) -> Sequence {
    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    if !entry.has_finished() {
        if let Some(c) = uncordon(api_node, entry) {
            steps.push(Box::new(c));
        }
    }
    steps.push(Box::new(DequeueRepairEntry { entry: entry.clone() }));
    Sequence::new("repair-dequeue", vec![entry.address.clone()], steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::run_to_end;
    use crate::testutil::{ctx, elect, test_cluster};
    use cke_core::status::KubeNode;
    use cke_infra::fake::FakeInfra;

    const ADDR: &str = "10.0.1.1";

    fn step(need_drain: bool, watch_seconds: u64) -> RepairStep {
        RepairStep {
            repair_command: vec!["repair".into()],
            need_drain,
            watch_seconds,
            health_check_command: vec!["health".into()],
            command_timeout_seconds: 30,
        }
    }

    async fn setup() -> (FakeInfra, RepairQueueEntry) {
        let infra = FakeInfra::new();
        elect(&infra).await;
        infra.kube.state().nodes.push(KubeNode {
            name: ADDR.into(),
            ready: true,
            ..Default::default()
        });
        let mut entry = RepairQueueEntry::new("unreachable", "qemu", ADDR, "");
        entry.nodename = ADDR.into();
        infra.storage.register_repair_entry(&mut entry).await.unwrap();
        (infra, entry)
    }

    #[tokio::test]
    async fn test_execute_with_drain() {
        let (infra, entry) = setup().await;
        let c = test_cluster(1, 1);
        let mut op = RepairExecuteOp::new(&c.nodes[0], &entry, &step(true, 60), Duration::from_secs(5));
        let done = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        let names: Vec<_> = done.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["update-repair-entry", "cordon", "evict-pods", "run-local-command", "update-repair-entry"]
        );
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!(stored.status, RepairStatus::Processing);
        assert_eq!(stored.step_status, RepairStepStatus::Watching);
        assert!(infra.kube.state().nodes[0].unschedulable);
    }

    #[tokio::test]
    async fn test_repair_command_failure_fails_entry() {
        let (infra, entry) = setup().await;
        let c = test_cluster(1, 1);
        infra.local.respond("repair", Err("bmc unreachable"));
        let mut op = RepairExecuteOp::new(&c.nodes[0], &entry, &step(false, 60), Duration::from_secs(5));
        assert!(run_to_end(&mut op, &ctx(&infra, &c)).await.is_err());
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!(stored.status, RepairStatus::Failed);
        assert!(stored.has_finished());
    }

    #[tokio::test]
    async fn test_healthy_entry_succeeds() {
        let (infra, mut entry) = setup().await;
        let c = test_cluster(1, 1);
        infra.kube.state().nodes[0].unschedulable = true;
        infra.local.respond("health", Ok("true\n"));
        entry.transition(RepairStatus::Processing, RepairStepStatus::Watching, chrono::Utc::now());
        let mut op = check_op(&c.nodes[0], &entry, &step(true, 60), 1);
        run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!(stored.status, RepairStatus::Succeeded);
        assert!(!infra.kube.state().nodes[0].unschedulable);
    }

    #[tokio::test]
    async fn test_watch_timeout_advances_then_fails() {
        let (infra, mut entry) = setup().await;
        let c = test_cluster(1, 1);
        infra.local.respond("health", Ok("false"));
        let cx = ctx(&infra, &c);
        let long_ago = cx.now - chrono::Duration::seconds(120);

        // Still inside the watch period: nothing changes.
        entry.transition(RepairStatus::Processing, RepairStepStatus::Watching, cx.now);
        run_to_end(&mut check_op(&c.nodes[0], &entry, &step(false, 60), 2), &cx)
            .await
            .unwrap();
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!(stored.step, 0);
        assert_eq!(stored.status, RepairStatus::Queued);

        entry.transition(RepairStatus::Processing, RepairStepStatus::Watching, long_ago);
        run_to_end(&mut check_op(&c.nodes[0], &entry, &step(false, 60), 2), &cx)
            .await
            .unwrap();
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!((stored.step, stored.step_status), (1, RepairStepStatus::Waiting));

        let mut last = stored;
        last.transition(RepairStatus::Processing, RepairStepStatus::Watching, long_ago);
        run_to_end(&mut check_op(&c.nodes[0], &last, &step(false, 60), 2), &cx)
            .await
            .unwrap();
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert_eq!(stored.status, RepairStatus::Failed);
    }

    #[tokio::test]
    async fn test_entry_deleted_meanwhile_is_not_processed() {
        let (infra, entry) = setup().await;
        let c = test_cluster(1, 1);
        let mut marked = infra.storage.get_repair_entry(entry.index).await.unwrap();
        marked.deleted = true;
        infra.storage.update_repair_entry(None, &marked).await.unwrap();

        let mut op = RepairExecuteOp::new(&c.nodes[0], &entry, &step(true, 60), Duration::from_secs(5));
        let err = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap_err();
        assert!(cke_core::is_conflicted(&err));
        let stored = infra.storage.get_repair_entry(entry.index).await.unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.status, RepairStatus::Queued);
        assert!(infra.local.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_deleted_entry() {
        let (infra, mut entry) = setup().await;
        let c = test_cluster(1, 1);
        infra.kube.state().nodes[0].unschedulable = true;
        entry.deleted = true;
        entry.status = RepairStatus::Processing;
        let mut op = dequeue_op(&c.nodes[0], &entry);
        let done = run_to_end(&mut op, &ctx(&infra, &c)).await.unwrap();
        assert_eq!(done[0].name, "uncordon");
        assert!(!infra.kube.state().nodes[0].unschedulable);
        assert!(infra.storage.get_repair_entries().await.unwrap().is_empty());
    }
}
