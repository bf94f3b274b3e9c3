//! Leader election and the reconciliation loop.
//!
//! One process at a time holds the leader key. Each term runs passes of
//! collect, decide, execute and record until the key disappears or the
//! process is asked to stop.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use cke_core::constraints::Constraints;
use cke_core::node::{Node, validate_node};
use cke_core::record::{OperationPhase, Record, ServerStatus};
use cke_core::config::ServerConfig;
use cke_core::{is_no_leader, is_not_found};
use cke_infra::{CertIssuer, Infrastructure};
use cke_op::{Operator, RunContext, static_resources};
use cke_sabakan::Integrator;
use cke_storage::{LeaderKey, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::collect;
use crate::metrics::Metrics;
use crate::strategy::{DecideInput, decide_ops};

/// Builds the infrastructure of one pass from the validated nodes.
pub type InfraFactory = Arc<dyn Fn(&[Node]) -> Arc<dyn Infrastructure> + Send + Sync>;

/// What one pass ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// No operator was chosen; the phase tells why.
    Idle(OperationPhase),
    /// The operation with this record id ran to the end.
    Completed(i64),
    /// The operation with this record id failed or was cancelled.
    Failed(i64),
}

pub struct Controller {
    storage: Storage,
    certs: Arc<dyn CertIssuer>,
    factory: InfraFactory,
    hostname: String,
    config: ServerConfig,
    metrics: Arc<Metrics>,
    integrator: Integrator,
}

impl Controller {
    pub fn new(
        storage: Storage,
        certs: Arc<dyn CertIssuer>,
        factory: InfraFactory,
        hostname: impl Into<String>,
        config: ServerConfig,
        metrics: Arc<Metrics>,
        integrator: Integrator,
    ) -> Self {
        Self {
            storage,
            certs,
            factory,
            hostname: hostname.into(),
            config,
            metrics,
            integrator,
        }
    }

    /// Campaign, lead while elected, and campaign again after losing the key.
    ///
    /// Returns once `shutdown` is cancelled; the key is resigned on the way out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let kv = self.storage.kv().clone();
        let election = self.storage.leader_election_name();
        loop {
            let leader = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                res = kv.campaign(&election, &self.hostname, self.config.session_ttl_secs) => {
                    res.context("campaign for leadership")?
                }
            };
            info!(key = %leader.key, host = %self.hostname, "elected as leader");
            self.metrics.set_leader(true);

            let term = shutdown.child_token();
            let watcher = spawn_key_watcher(&self.storage, &leader, term.clone()).await?;

            if let Err(e) = self.lead(&leader.key, &term).await {
                if is_no_leader(&e) {
                    warn!("leader key vanished, ending term");
                } else {
                    warn!(error = %format!("{e:#}"), "leader term ended with error");
                }
            }

            term.cancel();
            watcher.abort();
            self.metrics.set_leader(false);
            if let Err(e) = kv.resign(&leader).await {
                warn!(error = %format!("{e:#}"), "failed to resign");
            }
            info!(key = %leader.key, "stepped down");
            if shutdown.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn lead(&self, leader: &str, term: &CancellationToken) -> Result<()> {
        let mut wake = self.storage.watch_sabakan().await?;
        loop {
            if term.is_cancelled() {
                return Ok(());
            }
            match self.run_once(leader, term).await {
                Ok(PassOutcome::Completed(id)) => {
                    debug!(record = id, "operation completed, continuing without delay");
                    continue;
                }
                Ok(outcome) => debug!(?outcome, "pass finished"),
                Err(e) if is_no_leader(&e) => return Err(e),
                Err(e) => warn!(error = %format!("{e:#}"), "pass failed"),
            }
            tokio::select! {
                _ = term.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval()) => {}
                ev = wake.recv() => {
                    match ev {
                        Some(ev) => debug!(key = %ev.key, "inventory settings changed"),
                        None => wake = self.storage.watch_sabakan().await?,
                    }
                }
            }
        }
    }

    /// One reconciliation pass under the leader key `leader`.
    pub async fn run_once(&self, leader: &str, cancel: &CancellationToken) -> Result<PassOutcome> {
        self.integrate(leader).await?;

        let mut cluster = match self.storage.get_cluster().await {
            Ok(c) => c,
            Err(e) if is_not_found(&e) => {
                debug!("no cluster configuration");
                self.report(leader, OperationPhase::Completed, None).await?;
                return Ok(PassOutcome::Idle(OperationPhase::Completed));
            }
            Err(e) => return Err(e.context("load cluster")),
        };
        let constraints = match self.storage.get_constraints().await {
            Ok(c) => c,
            Err(e) if is_not_found(&e) => Constraints::default(),
            Err(e) => return Err(e.context("load constraints")),
        };
        constraints.check(&cluster)?;
        cluster.validate(false)?;
        let ssh_keys = self.certs.ssh_keys().await.context("load SSH keys")?;
        for node in &mut cluster.nodes {
            validate_node(node, &ssh_keys)?;
        }

        let owned = static_resources(&cluster).context("render static resources")?;
        let resources = self.storage.list_resources().await?;
        let reboot_entries = self.storage.get_reboot_entries().await?;
        let reboot_disabled = self.storage.is_reboot_queue_disabled().await?;
        let repair_entries = self.storage.get_repair_entries().await?;
        let repair_disabled = self.storage.is_repair_queue_disabled().await?;

        let infra = (self.factory)(&cluster.nodes);
        let outcome = async {
            let status = tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("pass cancelled"),
                st = collect(infra.as_ref(), &cluster, &owned, &resources) => st,
            };
            let now = Utc::now();
            let (op, phase) = decide_ops(&DecideInput {
                cluster: &cluster,
                status: &status,
                constraints: &constraints,
                static_resources: &owned,
                resources: &resources,
                reboot_entries: &reboot_entries,
                reboot_disabled,
                repair_entries: &repair_entries,
                repair_disabled,
                now,
            });
            let Some(mut op) = op else {
                self.report(leader, phase, None).await?;
                return Ok(PassOutcome::Idle(phase));
            };
            let ctx = RunContext {
                infra: infra.as_ref(),
                cluster: &cluster,
                leader,
                cancel: cancel.clone(),
                now,
            };
            self.execute(op.as_mut(), phase, &ctx).await
        }
        .await;
        infra.close().await;
        outcome
    }

    async fn integrate(&self, leader: &str) -> Result<()> {
        if let Err(e) = self.integrator.run_once(&self.storage, leader).await {
            if is_no_leader(&e) {
                return Err(e);
            }
            warn!(error = %format!("{e:#}"), "inventory integration failed");
        }
        if let Err(e) = self.integrator.run_auto_repair(&self.storage).await {
            if is_no_leader(&e) {
                return Err(e);
            }
            warn!(error = %format!("{e:#}"), "inventory-triggered repair failed");
        }
        Ok(())
    }

    async fn execute(&self, op: &mut dyn Operator, phase: OperationPhase, ctx: &RunContext<'_>) -> Result<PassOutcome> {
        let id = self.storage.next_record_id().await?;
        let mut record = Record::new(id, &op.name(), op.targets(), ctx.leader);
        self.storage.register_record(ctx.leader, &record).await?;
        self.report(ctx.leader, phase, Some(id)).await?;
        info!(op = %record.operation, record = id, targets = ?record.targets, "operation started");

        let mut failure = None;
        while let Some(cmd) = op.next_command() {
            if let Err(e) = ctx.check_cancelled() {
                failure = Some(e);
                break;
            }
            record.set_command(cmd.command());
            self.storage.update_record(ctx.leader, &record).await?;
            info!(op = %record.operation, command = %record.command, "running command");
            if let Err(e) = cmd.run(ctx).await {
                if let Err(ce) = op.cleanup(ctx).await {
                    warn!(op = %record.operation, error = %format!("{ce:#}"), "cleanup failed");
                }
                if is_no_leader(&e) {
                    warn!(op = %record.operation, record = id, "leadership lost during operation");
                    return Err(e);
                }
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => {
                record.complete();
                self.storage.update_record(ctx.leader, &record).await?;
                info!(op = %record.operation, record = id, "operation completed");
                Ok(PassOutcome::Completed(id))
            }
            Some(e) => {
                if ctx.cancel.is_cancelled() {
                    record.cancel();
                    info!(op = %record.operation, record = id, "operation cancelled");
                } else {
                    record.fail(&e);
                    warn!(op = %record.operation, record = id, error = %record.error, "operation failed");
                }
                self.storage.update_record(ctx.leader, &record).await?;
                Ok(PassOutcome::Failed(id))
            }
        }
    }

    async fn report(&self, leader: &str, phase: OperationPhase, record_id: Option<i64>) -> Result<()> {
        let status = ServerStatus {
            phase,
            timestamp: Utc::now(),
            leader: self.hostname.clone(),
            record_id,
        };
        self.storage.put_status(leader, &status).await?;
        self.metrics.update_phase(phase, status.timestamp);
        Ok(())
    }
}

/// Cancel `term` when the leader key is deleted (lease expiry or a forced resign).
async fn spawn_key_watcher(
    storage: &Storage,
    leader: &LeaderKey,
    term: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut events = storage.kv().watch_prefix(&leader.key).await?;
    let key = leader.key.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.cancelled() => return,
                ev = events.recv() => match ev {
                    Some(ev) if ev.deleted && ev.key == key => {
                        warn!(key = %key, "leader key deleted");
                        term.cancel();
                        return;
                    }
                    Some(_) => {}
                    None => {
                        term.cancel();
                        return;
                    }
                },
            }
        }
    }))
}
