use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cke_core::cluster::Cluster;
use cke_core::record::Command;
use cke_infra::Infrastructure;
use tokio_util::sync::CancellationToken;

/// Everything a commander may touch while it runs.
pub struct RunContext<'a> {
    pub infra: &'a dyn Infrastructure,
    pub cluster: &'a Cluster,
    /// Leader key witnessing every storage write of the pass.
    pub leader: &'a str,
    /// Cancelled when leadership is lost or the process shuts down.
    pub cancel: CancellationToken,
    pub now: DateTime<Utc>,
}

impl RunContext<'_> {
    /// Fail fast if the pass was cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

/// One auditable step.
#[async_trait]
pub trait Commander: Send + Sync {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()>;
    fn command(&self) -> Command;
}

/// A named, stateful producer of commanders that together make one change.
#[async_trait]
pub trait Operator: Send {
    fn name(&self) -> String;

    fn targets(&self) -> Vec<String>;

    /// Next step, or `None` once the operation is done.
    fn next_command(&mut self) -> Option<Box<dyn Commander>>;

    /// Scrub after a failed step.
    async fn cleanup(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Operator issuing a fixed list of commanders in order.
pub struct Sequence {
    name: String,
    targets: Vec<String>,
    steps: std::collections::VecDeque<Box<dyn Commander>>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, targets: Vec<String>, steps: Vec<Box<dyn Commander>>) -> Self {
        Self {
            name: name.into(),
            targets,
            steps: steps.into(),
        }
    }
}

#[async_trait]
impl Operator for Sequence {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        self.steps.pop_front()
    }
}

/// Drive `op` to completion without recording, returning the commands run.
///
/// A failing step triggers the operator's cleanup and ends the run.
pub async fn run_to_end(op: &mut dyn Operator, ctx: &RunContext<'_>) -> Result<Vec<Command>> {
    let mut done = Vec::new();
    while let Some(cmd) = op.next_command() {
        ctx.check_cancelled()?;
        done.push(cmd.command());
        if let Err(e) = cmd.run(ctx).await {
            if let Err(ce) = op.cleanup(ctx).await {
                tracing::warn!(op = %op.name(), error = %format!("{ce:#}"), "cleanup failed");
            }
            return Err(e);
        }
    }
    Ok(done)
}
